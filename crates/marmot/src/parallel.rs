// Data parallelism: batch sharding and the replicated-parameter trainer.
//
// COMPONENTS:
//
//   split_and_load()    - Partitions a batch along dim 0 into contiguous
//                         shards and places shard k on devices[k].
//
//   ParallelTrainer<M>  - Holds one model replica per device handle.
//                         initialize() broadcasts the reference replica's
//                         parameter values to every handle; train_step()
//                         runs forward/backward per shard on its own
//                         replica (rayon workers) and then applies one
//                         fused SGD update; step() is that update rule.
//
// The update for every parameter is
//
//     param -= lr * sum_over_replicas(grad) / effective_batch_size
//
// applied identically to each replica, so replicas that start in sync
// stay in sync. Per-shard losses are SUMS over the shard's examples;
// dividing once by the full batch size makes the update independent of
// how the batch was sharded.

use rayon::prelude::*;

use marmot_core::backend::{Backend, BackendDevice};
use marmot_core::backprop::GradStore;
use marmot_core::error::Result;
use marmot_core::tensor::Tensor;
use marmot_core::{bail, Error};

use marmot_nn::{softmax_cross_entropy, Module, Reduction};

/// Partition a batch across an ordered device set.
///
/// The batch is cut along dimension 0 into contiguous shards of size
/// ceil(B / K) (the final shard takes the remainder), and shard k is
/// copied onto `devices[k]`. Concatenating the shards in order
/// reconstructs the batch exactly. When the batch has fewer rows than
/// there are devices, only the first `B` devices receive a shard.
pub fn split_and_load<B: Backend>(
    batch: &Tensor<B>,
    devices: &[B::Device],
) -> Result<Vec<Tensor<B>>> {
    if devices.is_empty() {
        bail!("split_and_load: empty device list");
    }
    if batch.rank() == 0 {
        bail!("split_and_load: cannot shard a scalar");
    }
    let chunks = batch.chunk(devices.len(), 0)?;
    chunks
        .iter()
        .zip(devices.iter())
        .map(|(chunk, device)| chunk.to_device(device))
        .collect()
}

/// Trainer that keeps one model replica per device handle and updates all
/// replicas in lockstep.
pub struct ParallelTrainer<B: Backend, M: Module<B>> {
    devices: Vec<B::Device>,
    replicas: Vec<M>,
    lr: f64,
    initialized: bool,
}

impl<B: Backend, M: Module<B>> ParallelTrainer<B, M> {
    /// Build one replica per device with the given constructor.
    ///
    /// The builder is called once per handle and must produce models with
    /// identical parameter layouts (same shapes in the same order);
    /// values may differ until `initialize` broadcasts them.
    pub fn new<F>(builder: F, devices: &[B::Device], lr: f64) -> Result<Self>
    where
        F: Fn(&B::Device) -> Result<M>,
    {
        if devices.is_empty() {
            bail!("ParallelTrainer: empty device list");
        }
        if lr <= 0.0 {
            bail!("ParallelTrainer: learning rate must be > 0, got {}", lr);
        }

        let replicas: Vec<M> = devices.iter().map(&builder).collect::<Result<Vec<_>>>()?;

        // Every replica must put its parameters on its own handle, and
        // all replicas must agree on the parameter layout.
        let reference: Vec<_> = replicas[0].parameters();
        for (replica, device) in replicas.iter().zip(devices.iter()) {
            let params = replica.parameters();
            if params.len() != reference.len() {
                bail!(
                    "ParallelTrainer: replica on {} has {} parameters, expected {}",
                    device.name(),
                    params.len(),
                    reference.len()
                );
            }
            for (p, r) in params.iter().zip(reference.iter()) {
                if p.device() != device {
                    return Err(Error::DeviceMismatch {
                        lhs: p.device().name(),
                        rhs: device.name(),
                    });
                }
                if p.dims() != r.dims() {
                    bail!(
                        "ParallelTrainer: replica on {} disagrees on parameter shape: {:?} vs {:?}",
                        device.name(),
                        p.dims(),
                        r.dims()
                    );
                }
            }
        }

        Ok(Self {
            devices: devices.to_vec(),
            replicas,
            lr,
            initialized: false,
        })
    }

    /// The ordered device set.
    pub fn devices(&self) -> &[B::Device] {
        &self.devices
    }

    /// Number of replicas (= number of devices).
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// The replica on `devices[i]`.
    pub fn replica(&self, i: usize) -> &M {
        &self.replicas[i]
    }

    /// The reference replica (device 0), used for evaluation.
    pub fn reference_replica(&self) -> &M {
        &self.replicas[0]
    }

    /// The configured learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Whether `initialize` has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set every replica's parameters to the reference replica's values.
    ///
    /// After this call all replicas hold bit-identical parameters. A
    /// second call without `force` is rejected; `force = true` overwrites
    /// whatever training has produced since.
    pub fn initialize(&mut self, force: bool) -> Result<()> {
        if self.initialized && !force {
            bail!("ParallelTrainer: already initialized (pass force to re-initialize)");
        }

        let src: Vec<Vec<f64>> = self.replicas[0]
            .parameters()
            .iter()
            .map(|p| p.to_f64_vec())
            .collect::<Result<Vec<_>>>()?;

        for replica in self.replicas.iter().skip(1) {
            for (dst, values) in replica.parameters().iter().zip(src.iter()) {
                dst.update_data_inplace(values)?;
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// One data-parallel training step.
    ///
    /// Shards `input` and `target` across the device set, runs the
    /// forward pass and per-example softmax cross-entropy (summed per
    /// shard) with backward on each shard's replica concurrently, then
    /// applies the fused update. Returns the loss summed over the whole
    /// batch.
    pub fn train_step(&self, input: &Tensor<B>, target: &Tensor<B>) -> Result<f64> {
        if !self.initialized {
            bail!("ParallelTrainer: call initialize() before training");
        }
        let batch_size = input.dims()[0];
        if target.dims()[0] != batch_size {
            bail!(
                "train_step: input batch {} != target batch {}",
                batch_size,
                target.dims()[0]
            );
        }

        let x_shards = split_and_load(input, &self.devices)?;
        let y_shards = split_and_load(target, &self.devices)?;

        // Shards are independent; rayon joins all workers before the
        // step, which is the barrier the update relies on.
        let results: Vec<(f64, GradStore<B>)> = x_shards
            .par_iter()
            .zip(y_shards.par_iter())
            .zip(self.replicas.par_iter())
            .map(|((x, y), replica)| {
                let logits = replica.forward(x)?;
                let loss = softmax_cross_entropy(&logits, y, Reduction::Sum)?;
                let loss_val = loss.to_scalar_f64()?;
                let grads = loss.backward()?;
                Ok((loss_val, grads))
            })
            .collect::<Result<Vec<_>>>()?;

        let loss_sum: f64 = results.iter().map(|(l, _)| l).sum();
        let grad_stores: Vec<GradStore<B>> = results.into_iter().map(|(_, g)| g).collect();

        self.step(&grad_stores, batch_size)?;
        Ok(loss_sum)
    }

    /// Aggregate per-replica gradients and update every replica.
    ///
    /// For each parameter position: sum that parameter's gradient over
    /// the replicas that produced one, then apply
    /// `param -= lr * sum / effective_batch_size` to all replicas. The
    /// gradient buffers are dropped once the call returns.
    ///
    /// Replica tensors live on distinct handles, so the sum is staged
    /// through host f64 buffers (the single-process analogue of a
    /// device-to-host all-reduce).
    pub fn step(&self, grad_stores: &[GradStore<B>], effective_batch_size: usize) -> Result<()> {
        if effective_batch_size == 0 {
            bail!("step: effective_batch_size must be > 0");
        }

        let param_sets: Vec<Vec<Tensor<B>>> =
            self.replicas.iter().map(|r| r.parameters()).collect();
        let num_params = param_sets[0].len();

        for j in 0..num_params {
            let mut summed: Option<Vec<f64>> = None;
            for (params, grads) in param_sets.iter().zip(grad_stores.iter()) {
                if let Some(g) = grads.get(&params[j]) {
                    let g_host = g.to_f64_vec()?;
                    match summed {
                        Some(ref mut acc) => {
                            for (a, v) in acc.iter_mut().zip(g_host.iter()) {
                                *a += v;
                            }
                        }
                        None => summed = Some(g_host),
                    }
                }
            }
            // A parameter no shard touched this step keeps its value.
            let Some(summed) = summed else {
                continue;
            };

            let scale = self.lr / effective_batch_size as f64;
            for params in &param_sets {
                let p = &params[j];
                let old = p.to_f64_vec()?;
                let new: Vec<f64> = old
                    .iter()
                    .zip(summed.iter())
                    .map(|(o, g)| o - scale * g)
                    .collect();
                p.update_data_inplace(&new)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::DType;
    use marmot_cpu::{CpuBackend, CpuDevice, CpuTensor};
    use marmot_nn::Linear;

    type B = CpuBackend;

    fn devices(n: usize) -> Vec<CpuDevice> {
        CpuDevice::all(n)
    }

    #[test]
    fn test_split_and_load_even() {
        let devs = devices(2);
        let batch = CpuTensor::from_f64_slice(
            &(0..8).map(|v| v as f64).collect::<Vec<_>>(),
            (4, 2),
            DType::F64,
            &devs[0],
        )
        .unwrap();
        let shards = split_and_load(&batch, &devs).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].dims(), &[2, 2]);
        assert_eq!(shards[1].dims(), &[2, 2]);
        assert_eq!(shards[0].device(), &devs[0]);
        assert_eq!(shards[1].device(), &devs[1]);
        assert_eq!(shards[0].to_f64_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(shards[1].to_f64_vec().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_split_and_load_uneven() {
        let devs = devices(3);
        let batch = CpuTensor::from_f64_slice(
            &(0..7).map(|v| v as f64).collect::<Vec<_>>(),
            (7, 1),
            DType::F64,
            &devs[0],
        )
        .unwrap();
        let shards = split_and_load(&batch, &devs).unwrap();
        // ceil(7/3) = 3, so shards are 3, 3, 1.
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].dims(), &[3, 1]);
        assert_eq!(shards[1].dims(), &[3, 1]);
        assert_eq!(shards[2].dims(), &[1, 1]);
    }

    #[test]
    fn test_split_and_load_more_devices_than_rows() {
        let devs = devices(5);
        let batch = CpuTensor::from_f64_slice(&[1.0, 2.0], (2, 1), DType::F64, &devs[0]).unwrap();
        let shards = split_and_load(&batch, &devs).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].device(), &devs[0]);
        assert_eq!(shards[1].device(), &devs[1]);
    }

    fn linear_builder(dev: &CpuDevice) -> Result<Linear<B>> {
        Linear::new(3, 2, true, DType::F64, dev)
    }

    #[test]
    fn test_initialize_broadcasts() {
        let devs = devices(3);
        let mut trainer = ParallelTrainer::new(linear_builder, &devs, 0.1).unwrap();

        // Replicas are built independently, so they start different.
        trainer.initialize(false).unwrap();

        let reference: Vec<Vec<f64>> = trainer
            .replica(0)
            .parameters()
            .iter()
            .map(|p| p.to_f64_vec().unwrap())
            .collect();
        for i in 1..trainer.num_replicas() {
            for (p, r) in trainer.replica(i).parameters().iter().zip(reference.iter()) {
                assert_eq!(&p.to_f64_vec().unwrap(), r);
            }
        }
    }

    #[test]
    fn test_initialize_twice_needs_force() {
        let devs = devices(2);
        let mut trainer = ParallelTrainer::new(linear_builder, &devs, 0.1).unwrap();
        trainer.initialize(false).unwrap();
        assert!(trainer.initialize(false).is_err());
        assert!(trainer.initialize(true).is_ok());
    }

    #[test]
    fn test_step_with_synthetic_gradients() {
        let devs = devices(2);
        let lr = 0.5;
        let mut trainer = ParallelTrainer::new(linear_builder, &devs, lr).unwrap();
        trainer.initialize(false).unwrap();

        let before: Vec<Vec<f64>> = trainer
            .replica(0)
            .parameters()
            .iter()
            .map(|p| p.to_f64_vec().unwrap())
            .collect();

        // Replica 0 contributes gradient 1.0 per element, replica 1
        // contributes 3.0 per element.
        let mut stores = Vec::new();
        for (i, grad_val) in [(0usize, 1.0f64), (1, 3.0)] {
            let mut store = GradStore::<B>::new();
            for p in trainer.replica(i).parameters() {
                let g = CpuTensor::full(p.shape().clone(), grad_val, p.dtype(), p.device())
                    .unwrap();
                store.accumulate(p.id(), g).unwrap();
            }
            stores.push(store);
        }

        let effective_batch = 8;
        trainer.step(&stores, effective_batch).unwrap();

        // new = old - lr * (1 + 3) / 8 = old - 0.25
        let expected_delta = lr * 4.0 / effective_batch as f64;
        for i in 0..trainer.num_replicas() {
            for (p, old) in trainer.replica(i).parameters().iter().zip(before.iter()) {
                let new = p.to_f64_vec().unwrap();
                for (n, o) in new.iter().zip(old.iter()) {
                    assert!((n - (o - expected_delta)).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_train_step_keeps_replicas_identical() {
        let devs = devices(2);
        let mut trainer = ParallelTrainer::new(
            |dev| Linear::new(4, 3, true, DType::F64, dev),
            &devs,
            0.05,
        )
        .unwrap();
        trainer.initialize(false).unwrap();

        let x = CpuTensor::rand((6, 4), DType::F64, &devs[0]).unwrap();
        let mut one_hot = vec![0.0; 18];
        for b in 0..6 {
            one_hot[b * 3 + b % 3] = 1.0;
        }
        let y = CpuTensor::from_f64_slice(&one_hot, (6, 3), DType::F64, &devs[0]).unwrap();

        let loss = trainer.train_step(&x, &y).unwrap();
        assert!(loss.is_finite());
        assert!(loss > 0.0);

        let reference: Vec<Vec<f64>> = trainer
            .replica(0)
            .parameters()
            .iter()
            .map(|p| p.to_f64_vec().unwrap())
            .collect();
        for (p, r) in trainer.replica(1).parameters().iter().zip(reference.iter()) {
            assert_eq!(&p.to_f64_vec().unwrap(), r);
        }
    }

    #[test]
    fn test_train_step_requires_initialize() {
        let devs = devices(2);
        let trainer = ParallelTrainer::new(linear_builder, &devs, 0.1).unwrap();
        let x = CpuTensor::rand((4, 3), DType::F64, &devs[0]).unwrap();
        let y = CpuTensor::zeros((4, 2), DType::F64, &devs[0]).unwrap();
        assert!(trainer.train_step(&x, &y).is_err());
    }
}
