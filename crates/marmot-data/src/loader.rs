// DataLoader: shuffling, transforms, and batching into tensors.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, SeedableRng};

use rayon::prelude::*;

use marmot_core::backend::Backend;
use marmot_core::tensor::Tensor;
use marmot_core::DType;

use crate::dataset::{Dataset, Sample};
use crate::transform::Transform;

/// Configuration for the DataLoader.
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Samples per batch.
    pub batch_size: usize,
    /// Shuffle indices at the start of each epoch.
    pub shuffle: bool,
    /// Drop the final incomplete batch.
    pub drop_last: bool,
    /// DType of the produced tensors.
    pub dtype: DType,
    /// Parallel workers for sample fetching (0 = sequential).
    pub num_workers: usize,
    /// Optional seed for reproducible shuffling.
    pub seed: Option<u64>,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            drop_last: false,
            dtype: DType::F32,
            num_workers: 0,
            seed: None,
        }
    }
}

impl DataLoaderConfig {
    pub fn batch_size(mut self, bs: usize) -> Self {
        self.batch_size = bs;
        self
    }

    pub fn shuffle(mut self, s: bool) -> Self {
        self.shuffle = s;
        self
    }

    pub fn drop_last(mut self, d: bool) -> Self {
        self.drop_last = d;
        self
    }

    pub fn dtype(mut self, d: DType) -> Self {
        self.dtype = d;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = Some(s);
        self
    }
}

/// One batch of stacked tensors: `[batch, ...feature_shape]` inputs and
/// `[batch, ...target_shape]` targets, both on the loader's device.
pub struct Batch<B: Backend> {
    pub input: Tensor<B>,
    pub target: Tensor<B>,
}

/// Wraps a Dataset and produces epochs of batched tensors.
///
/// Batches are always created on one device handle; the caller shards
/// them across a device set afterwards if it wants data parallelism.
pub struct DataLoader<'a, B: Backend> {
    dataset: &'a dyn Dataset,
    config: DataLoaderConfig,
    transforms: Vec<Box<dyn Transform>>,
    device: B::Device,
    indices: Vec<usize>,
}

impl<'a, B: Backend> DataLoader<'a, B> {
    /// Create a DataLoader over a dataset.
    pub fn new(dataset: &'a dyn Dataset, device: B::Device, config: DataLoaderConfig) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        Self {
            dataset,
            config,
            transforms: Vec::new(),
            device,
            indices,
        }
    }

    /// Add a transform applied to each sample.
    pub fn with_transform(mut self, t: Box<dyn Transform>) -> Self {
        self.transforms.push(t);
        self
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        if self.config.drop_last {
            self.dataset.len() / self.config.batch_size
        } else {
            self.dataset.len().div_ceil(self.config.batch_size)
        }
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Reshuffle indices; called automatically by `epoch_batches`.
    pub fn reshuffle(&mut self) {
        if self.config.shuffle {
            match self.config.seed {
                Some(seed) => {
                    let mut rng = StdRng::seed_from_u64(seed);
                    self.indices.shuffle(&mut rng);
                }
                None => {
                    let mut rng = thread_rng();
                    self.indices.shuffle(&mut rng);
                }
            }
        }
    }

    /// Fetch and transform a slice of samples, in parallel when workers
    /// are configured.
    fn fetch_samples(&self, indices: &[usize]) -> Vec<Sample> {
        let fetch_one = |&i: &usize| {
            let mut s = self.dataset.get(i);
            for t in &self.transforms {
                s = t.apply(s);
            }
            s
        };
        if self.config.num_workers > 0 && indices.len() > 1 {
            indices.par_iter().map(fetch_one).collect()
        } else {
            indices.iter().map(fetch_one).collect()
        }
    }

    /// Reset the iteration order and produce all batches for one epoch.
    pub fn epoch_batches(&mut self) -> Result<Vec<Batch<B>>, marmot_core::Error> {
        self.reshuffle();

        let bs = self.config.batch_size;
        let n = self.dataset.len();
        let num_batches = self.num_batches();
        let mut batches = Vec::with_capacity(num_batches);

        for batch_idx in 0..num_batches {
            let start = batch_idx * bs;
            let end = (start + bs).min(n);
            let actual_bs = end - start;

            let batch_indices: Vec<usize> = (start..end).map(|i| self.indices[i]).collect();
            let samples = self.fetch_samples(&batch_indices);

            let feat_shape = samples[0].feature_shape.clone();
            let tgt_shape = samples[0].target_shape.clone();

            let mut feat_data: Vec<f64> = Vec::with_capacity(actual_bs * samples[0].features.len());
            let mut tgt_data: Vec<f64> = Vec::with_capacity(actual_bs * samples[0].target.len());

            for s in &samples {
                feat_data.extend_from_slice(&s.features);
                tgt_data.extend_from_slice(&s.target);
            }

            let mut batch_feat_shape = vec![actual_bs];
            batch_feat_shape.extend_from_slice(&feat_shape);

            let mut batch_tgt_shape = vec![actual_bs];
            batch_tgt_shape.extend_from_slice(&tgt_shape);

            let input = Tensor::<B>::from_f64_slice(
                &feat_data,
                batch_feat_shape,
                self.config.dtype,
                &self.device,
            )?;

            let target = Tensor::<B>::from_f64_slice(
                &tgt_data,
                batch_tgt_shape,
                self.config.dtype,
                &self.device,
            )?;

            batches.push(Batch { input, target });
        }

        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mnist::{MnistDataset, MnistSplit};
    use crate::transform::{Normalize, OneHotEncode, ReshapeFeatures};
    use marmot_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn test_batch_shapes() {
        let ds = MnistDataset::synthetic(10, MnistSplit::Train);
        let config = DataLoaderConfig::default()
            .batch_size(4)
            .shuffle(false)
            .dtype(DType::F64);
        let mut loader = DataLoader::<CpuBackend>::new(&ds, CpuDevice::new(0), config)
            .with_transform(Box::new(Normalize::new(255.0)))
            .with_transform(Box::new(ReshapeFeatures::new(vec![1, 28, 28])))
            .with_transform(Box::new(OneHotEncode::new(10)));

        assert_eq!(loader.num_batches(), 3);
        let batches = loader.epoch_batches().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].input.dims(), &[4, 1, 28, 28]);
        assert_eq!(batches[0].target.dims(), &[4, 10]);
        // Final ragged batch keeps the remaining 2 samples.
        assert_eq!(batches[2].input.dims(), &[2, 1, 28, 28]);
    }

    #[test]
    fn test_drop_last() {
        let ds = MnistDataset::synthetic(10, MnistSplit::Train);
        let config = DataLoaderConfig::default()
            .batch_size(4)
            .shuffle(false)
            .drop_last(true);
        let mut loader = DataLoader::<CpuBackend>::new(&ds, CpuDevice::new(0), config);
        assert_eq!(loader.num_batches(), 2);
        assert_eq!(loader.epoch_batches().unwrap().len(), 2);
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let ds = MnistDataset::synthetic(32, MnistSplit::Train);
        let mk = || {
            DataLoader::<CpuBackend>::new(
                &ds,
                CpuDevice::new(0),
                DataLoaderConfig::default().batch_size(8).seed(7),
            )
        };
        let a = mk().epoch_batches().unwrap();
        let b = mk().epoch_batches().unwrap();
        assert_eq!(
            a[0].input.to_f64_vec().unwrap(),
            b[0].input.to_f64_vec().unwrap()
        );
    }

    #[test]
    fn test_parallel_fetch_matches_sequential() {
        let ds = MnistDataset::synthetic(16, MnistSplit::Train);
        let seq = DataLoader::<CpuBackend>::new(
            &ds,
            CpuDevice::new(0),
            DataLoaderConfig::default().batch_size(16).shuffle(false),
        )
        .epoch_batches()
        .unwrap();
        let par = DataLoader::<CpuBackend>::new(
            &ds,
            CpuDevice::new(0),
            DataLoaderConfig::default()
                .batch_size(16)
                .shuffle(false)
                .num_workers(4),
        )
        .epoch_batches()
        .unwrap();
        assert_eq!(
            seq[0].input.to_f64_vec().unwrap(),
            par[0].input.to_f64_vec().unwrap()
        );
    }
}
