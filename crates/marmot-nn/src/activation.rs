// Activation modules: thin wrappers turning tensor-level activations into
// Module implementations so they compose inside Sequential.

use marmot_core::backend::Backend;
use marmot_core::error::Result;
use marmot_core::tensor::Tensor;

use crate::module::Module;

/// ReLU activation: max(0, x).
pub struct ReLU;

impl<B: Backend> Module<B> for ReLU {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.relu()
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
