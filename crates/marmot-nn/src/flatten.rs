// Flatten: collapse trailing dimensions into one feature dimension.
//
// Sits between the convolutional blocks and the classifier head:
// [N, C, H, W] becomes [N, C*H*W].

use marmot_core::backend::Backend;
use marmot_core::error::Result;
use marmot_core::shape::Shape;
use marmot_core::tensor::Tensor;

use crate::module::Module;

/// Flatten layer: collapses dims `[start_dim..]` into one.
pub struct Flatten {
    start_dim: usize,
}

impl Flatten {
    /// Flatten from `start_dim` through the last dimension.
    /// `start_dim = 1` keeps the batch dimension.
    pub fn new(start_dim: usize) -> Self {
        Flatten { start_dim }
    }
}

impl Default for Flatten {
    /// Batch-preserving flatten: [N, ...] to [N, flat].
    fn default() -> Self {
        Flatten { start_dim: 1 }
    }
}

impl<B: Backend> Module<B> for Flatten {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let dims = x.dims();
        if self.start_dim >= dims.len() {
            return Ok(x.clone());
        }

        let mut new_dims: Vec<usize> = dims[..self.start_dim].to_vec();
        let flat: usize = dims[self.start_dim..].iter().product();
        new_dims.push(flat);

        x.reshape(Shape::new(new_dims))
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
