//! # marmot-data
//!
//! Data loading, datasets, and batching for Marmot.
//!
//! Provides:
//! - [`Dataset`] trait: unified interface over any sample source
//! - [`MnistDataset`]: IDX format parser (plain or gzip files), plus a
//!   synthetic generator for tests and demos
//! - Transforms: [`Normalize`], [`ReshapeFeatures`], [`OneHotEncode`]
//! - [`DataLoader`]: shuffling, per-sample transforms, batch tensors

pub mod dataset;
pub mod loader;
pub mod mnist;
pub mod transform;

pub use dataset::{Dataset, Sample};
pub use loader::{Batch, DataLoader, DataLoaderConfig};
pub use mnist::{MnistDataset, MnistError, MnistSplit};
pub use transform::{Normalize, OneHotEncode, ReshapeFeatures, Transform};
