// Module trait: the interface every neural network layer implements.
//
// Each layer is a plain struct implementing Module, generic over the
// backend so one network definition runs on any device implementation.
// forward() defines the computation; parameters() exposes the trainable
// tensors for the optimizer.

use marmot_core::backend::Backend;
use marmot_core::error::Result;
use marmot_core::tensor::Tensor;

/// The fundamental trait for all neural network layers.
pub trait Module<B: Backend>: Send + Sync {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// All trainable parameters of this module, in construction order.
    ///
    /// The order must be stable: the data-parallel trainer matches
    /// parameters across replicas positionally.
    fn parameters(&self) -> Vec<Tensor<B>>;

    /// Trainable parameters with human-readable names. Leaf modules
    /// override this with names like "weight"/"bias"; composites prefix
    /// with the child's position. The default is positional.
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }

    /// Total number of scalar parameters in this module.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }
}
