// End-to-end properties of the data-parallel training path.

use marmot::prelude::*;
use marmot::data::{DataLoader, DataLoaderConfig, MnistDataset, MnistSplit, Normalize, OneHotEncode};

type B = CpuBackend;

// Splitting then concatenating shards reproduces the original batch
// exactly, for assorted batch sizes and device counts.
#[test]
fn split_then_cat_is_identity() {
    for (batch_size, num_devices) in [(8usize, 1usize), (8, 2), (10, 3), (7, 4), (3, 8), (1, 2)] {
        let devices = CpuDevice::all(num_devices);
        let data: Vec<f64> = (0..batch_size * 3).map(|v| v as f64 * 0.5).collect();
        let batch =
            CpuTensor::from_f64_slice(&data, vec![batch_size, 3], DType::F64, &devices[0]).unwrap();

        let shards = split_and_load(&batch, &devices).unwrap();
        assert_eq!(shards.len(), num_devices.min(batch_size));
        for (k, shard) in shards.iter().enumerate() {
            assert_eq!(shard.device(), &devices[k]);
        }

        // Reassemble on the reference device.
        let home: Vec<CpuTensor> = shards
            .iter()
            .map(|s| s.to_device(&devices[0]).unwrap())
            .collect();
        let rebuilt = CpuTensor::cat(&home, 0).unwrap();
        assert_eq!(rebuilt.dims(), batch.dims());
        assert_eq!(rebuilt.to_f64_vec().unwrap(), data);
    }
}

fn tiny_net(dev: &CpuDevice) -> marmot_core::Result<Sequential<B>> {
    Ok(Sequential::new()
        .add(Linear::new(4, 8, true, DType::F64, dev)?)
        .add(ReLU)
        .add(Linear::new(8, 3, true, DType::F64, dev)?))
}

// After initialize, every replica holds bit-identical parameter values.
#[test]
fn initialize_makes_replicas_bit_identical() {
    let devices = CpuDevice::all(4);
    let mut trainer = ParallelTrainer::new(tiny_net, &devices, 0.1).unwrap();
    trainer.initialize(false).unwrap();

    let reference: Vec<Vec<f64>> = trainer
        .reference_replica()
        .parameters()
        .iter()
        .map(|p| p.to_f64_vec().unwrap())
        .collect();

    for i in 1..trainer.num_replicas() {
        for (p, r) in trainer.replica(i).parameters().iter().zip(reference.iter()) {
            let bits_p: Vec<u64> = p
                .to_f64_vec()
                .unwrap()
                .iter()
                .map(|v| v.to_bits())
                .collect();
            let bits_r: Vec<u64> = r.iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits_p, bits_r);
        }
    }
}

// A fixed deterministic toy problem: 12 samples in 3 classes.
fn toy_batches(dev: &CpuDevice) -> (CpuTensor, CpuTensor) {
    let n = 12;
    let mut x = Vec::with_capacity(n * 4);
    let mut y = vec![0.0; n * 3];
    for i in 0..n {
        let class = i % 3;
        for f in 0..4 {
            // Deterministic class-dependent pattern with some spread.
            x.push((class as f64 + 1.0) * 0.3 + (f as f64) * 0.1 + (i as f64) * 0.01);
        }
        y[i * 3 + class] = 1.0;
    }
    let x = CpuTensor::from_f64_slice(&x, vec![n, 4], DType::F64, dev).unwrap();
    let y = CpuTensor::from_f64_slice(&y, vec![n, 3], DType::F64, dev).unwrap();
    (x, y)
}

// Training on one device and on two devices from the same initialization
// produces the same parameters: sharding changes throughput, not math.
#[test]
fn one_and_two_devices_learn_identically() {
    let devs2 = CpuDevice::all(2);
    let devs1 = CpuDevice::all(1);
    let lr = 0.1;

    let mut trainer2 = ParallelTrainer::new(tiny_net, &devs2, lr).unwrap();
    trainer2.initialize(false).unwrap();

    let mut trainer1 = ParallelTrainer::new(tiny_net, &devs1, lr).unwrap();
    trainer1.initialize(false).unwrap();
    // Overwrite trainer1's weights with trainer2's so both start equal.
    for (dst, src) in trainer1
        .reference_replica()
        .parameters()
        .iter()
        .zip(trainer2.reference_replica().parameters().iter())
    {
        dst.update_data_inplace(&src.to_f64_vec().unwrap()).unwrap();
    }

    let (x, y) = toy_batches(&devs1[0]);
    for _ in 0..5 {
        trainer1.train_step(&x, &y).unwrap();
        trainer2.train_step(&x, &y).unwrap();
    }

    for (p1, p2) in trainer1
        .reference_replica()
        .parameters()
        .iter()
        .zip(trainer2.reference_replica().parameters().iter())
    {
        let a = p1.to_f64_vec().unwrap();
        let b = p2.to_f64_vec().unwrap();
        for (va, vb) in a.iter().zip(b.iter()) {
            assert!(
                (va - vb).abs() < 1e-6,
                "diverged: {va} vs {vb} (delta {})",
                (va - vb).abs()
            );
        }
    }
}

// Repeated steps reduce the loss on a learnable toy problem, and the
// replicas remain synchronized throughout.
#[test]
fn training_reduces_loss_and_keeps_sync() {
    let devices = CpuDevice::all(3);
    let mut trainer = ParallelTrainer::new(tiny_net, &devices, 0.2).unwrap();
    trainer.initialize(false).unwrap();

    let (x, y) = toy_batches(&devices[0]);
    let first = trainer.train_step(&x, &y).unwrap();
    let mut last = first;
    for _ in 0..30 {
        last = trainer.train_step(&x, &y).unwrap();
    }
    assert!(
        last < first,
        "loss did not decrease: first {first}, last {last}"
    );

    let reference: Vec<Vec<f64>> = trainer
        .reference_replica()
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

// The full epoch loop over synthetic MNIST: runs, times epochs, and
// reports an accuracy inside [0, 1] from the reference replica.
#[test]
fn fit_reports_bounded_accuracy() {
    let devices = CpuDevice::all(2);

    let build = |dev: &CpuDevice| -> marmot_core::Result<Sequential<B>> {
        Ok(Sequential::new()
            .add(Linear::new(784, 32, true, DType::F64, dev)?)
            .add(ReLU)
            .add(Linear::new(32, 10, true, DType::F64, dev)?))
    };

    let mut trainer = ParallelTrainer::new(build, &devices, 0.1).unwrap();
    trainer.initialize(false).unwrap();

    let train_ds = MnistDataset::synthetic(64, MnistSplit::Train);
    let val_ds = MnistDataset::synthetic(32, MnistSplit::Test);

    let mut train_loader = DataLoader::<B>::new(
        &train_ds,
        devices[0],
        DataLoaderConfig::default()
            .batch_size(16)
            .dtype(DType::F64)
            .seed(11),
    )
    .with_transform(Box::new(Normalize::new(255.0)))
    .with_transform(Box::new(OneHotEncode::new(10)));

    let mut val_loader = DataLoader::<B>::new(
        &val_ds,
        devices[0],
        DataLoaderConfig::default()
            .batch_size(16)
            .shuffle(false)
            .dtype(DType::F64),
    )
    .with_transform(Box::new(Normalize::new(255.0)))
    .with_transform(Box::new(OneHotEncode::new(10)));

    let result = marmot::fit(&trainer, &mut train_loader, &mut val_loader, 2).unwrap();
    assert_eq!(result.epochs.len(), 2);
    for log in &result.epochs {
        assert!((0.0..=1.0).contains(&log.val_accuracy));
        assert!(log.train_loss.is_finite());
        assert!(log.elapsed.as_nanos() > 0);
    }
    // Display formatting stays usable in logs and demos.
    let rendered = format!("{result}");
    assert!(rendered.contains("epoch 1"));
}
