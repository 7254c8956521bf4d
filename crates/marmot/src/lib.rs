//! # Marmot
//!
//! Data-parallel training of small convolutional networks across a set of
//! logical devices, built on a from-scratch tensor/autograd runtime.
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `marmot-core` | Tensor, Shape, DType, Layout, Backend trait, autograd |
//! | `marmot-cpu`  | CPU backend with ordinal device handles (`cpu:0`, ...) |
//! | `marmot-nn`   | Layers (Conv2d, MaxPool2d, Linear, ...), loss, metrics |
//! | `marmot-data` | Datasets (MNIST), transforms, batching DataLoader |
//! | `marmot`      | This facade: batch sharding, replicated trainer, epoch loop |
//!
//! ## The data-parallel scheme
//!
//! One model replica lives on each device handle, with parameters kept
//! value-synchronized. Every training batch is cut into contiguous
//! shards ([`split_and_load`]); each shard runs forward/backward on its
//! own replica; the trainer sums the per-replica gradients and applies
//! the same SGD update everywhere ([`ParallelTrainer::step`]). The
//! [`fit`] loop drives epochs, timing them at full barriers and scoring
//! validation accuracy on the reference replica.

pub use marmot_core::{
    backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp},
    op::{Op, TensorId},
    DType, Error, GradStore, Layout, Result, Shape, Tensor, WithDType,
};

pub use marmot_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export of the neural network building blocks.
pub mod nn {
    pub use marmot_nn::*;
}

/// Re-export of datasets and loaders.
pub mod data {
    pub use marmot_data::*;
}

/// Batch sharding and the replicated-parameter trainer.
pub mod parallel;

/// The epoch loop: fit and evaluate.
pub mod fit;

/// Wall-clock timing.
pub mod stopwatch;

pub use fit::{evaluate, fit, EpochLog, TrainResult};
pub use parallel::{split_and_load, ParallelTrainer};
pub use stopwatch::Stopwatch;

/// Prelude: the common types in one import.
pub mod prelude {
    pub use crate::fit::{evaluate, fit, EpochLog, TrainResult};
    pub use crate::nn::{
        accuracy, correct_predictions, softmax_cross_entropy, Conv2d, Flatten, Linear, MaxPool2d,
        Module, ReLU, Reduction, Sequential,
    };
    pub use crate::parallel::{split_and_load, ParallelTrainer};
    pub use crate::stopwatch::Stopwatch;
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, GradStore, Shape, Tensor};
}
