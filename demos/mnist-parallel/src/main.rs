// MNIST across multiple devices: data-parallel CNN training.
//
// Architecture:
//   Conv2d(1->20, 3x3) -> ReLU -> MaxPool2d(2x2)
//   Conv2d(20->50, 3x3) -> ReLU -> MaxPool2d(2x2)
//   Flatten -> Linear(50*5*5 -> 128) -> ReLU -> Linear(128 -> 10)
//
// One replica of the network lives on each logical device. Every batch
// is split into contiguous shards, each shard runs forward/backward on
// its own replica, and a single fused SGD step keeps the replicas
// synchronized. Per-epoch wall time and validation accuracy are printed
// so runs with --devices 1 and --devices 2 can be compared.
//
// Usage:
//   cargo run -p mnist-parallel                                # synthetic data
//   cargo run -p mnist-parallel -- --data-dir path/to/mnist    # real MNIST
//   cargo run -p mnist-parallel -- --devices 2 --epochs 5

use marmot::data::{
    DataLoader, DataLoaderConfig, MnistDataset, MnistSplit, Normalize, OneHotEncode,
    ReshapeFeatures,
};
use marmot::prelude::*;
use marmot::BackendDevice;

struct Config {
    data_dir: Option<String>,
    devices: usize,
    epochs: usize,
    batch_size: usize,
    lr: f64,
    train_samples: usize,
    test_samples: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            devices: 2,
            epochs: 5,
            batch_size: 64,
            lr: 0.1,
            train_samples: 2000,
            test_samples: 500,
        }
    }
}

fn parse_args() -> Config {
    let mut cfg = Config::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" => {
                i += 1;
                cfg.data_dir = Some(args[i].clone());
            }
            "--devices" => {
                i += 1;
                cfg.devices = args[i].parse().expect("invalid --devices");
            }
            "--epochs" => {
                i += 1;
                cfg.epochs = args[i].parse().expect("invalid --epochs");
            }
            "--batch-size" => {
                i += 1;
                cfg.batch_size = args[i].parse().expect("invalid --batch-size");
            }
            "--lr" => {
                i += 1;
                cfg.lr = args[i].parse().expect("invalid --lr");
            }
            "--samples" => {
                i += 1;
                cfg.train_samples = args[i].parse().expect("invalid --samples");
                cfg.test_samples = cfg.train_samples / 4;
            }
            "--help" | "-h" => {
                println!("Data-parallel MNIST CNN training");
                println!();
                println!("Options:");
                println!("  --data-dir <path>   Path to MNIST IDX files (plain or .gz)");
                println!("  --devices <n>       Number of logical devices (default: 2)");
                println!("  --epochs <n>        Training epochs (default: 5)");
                println!("  --batch-size <n>    Batch size (default: 64)");
                println!("  --lr <f>            Learning rate (default: 0.1)");
                println!("  --samples <n>       Synthetic training samples (default: 2000)");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    cfg
}

/// The two-block CNN: 28x28 shrinks to 13x13 after the first conv+pool
/// and to 5x5 after the second, leaving 50*5*5 = 1250 features.
fn build_cnn(dev: &CpuDevice) -> marmot::Result<Sequential<CpuBackend>> {
    let dtype = DType::F64;
    Ok(Sequential::new()
        .add(Conv2d::new(1, 20, [3, 3], [1, 1], [0, 0], true, dtype, dev)?)
        .add(ReLU)
        .add(MaxPool2d::new([2, 2], [2, 2], [0, 0]))
        .add(Conv2d::new(20, 50, [3, 3], [1, 1], [0, 0], true, dtype, dev)?)
        .add(ReLU)
        .add(MaxPool2d::new([2, 2], [2, 2], [0, 0]))
        .add(Flatten::default())
        .add(Linear::new(50 * 5 * 5, 128, true, dtype, dev)?)
        .add(ReLU)
        .add(Linear::new(128, 10, true, dtype, dev)?))
}

fn main() -> marmot::Result<()> {
    env_logger::init();
    let cfg = parse_args();

    println!("=== Marmot: data-parallel MNIST CNN ===");
    println!();

    // 1. Dataset
    let (train_ds, test_ds) = match &cfg.data_dir {
        Some(dir) => {
            println!("Loading MNIST from: {dir}");
            let train = MnistDataset::load(dir, MnistSplit::Train)
                .map_err(|e| marmot::Error::msg(format!("failed to load MNIST: {e}")))?;
            let test = MnistDataset::load(dir, MnistSplit::Test)
                .map_err(|e| marmot::Error::msg(format!("failed to load MNIST: {e}")))?;
            println!(
                "  train: {} images ({}x{})",
                train.num_samples(),
                train.image_dims().0,
                train.image_dims().1
            );
            println!("  test:  {} images", test.num_samples());
            (train, test)
        }
        None => {
            println!(
                "Using synthetic MNIST data ({} train, {} test)",
                cfg.train_samples, cfg.test_samples
            );
            println!("  Tip: use --data-dir <path> for the real dataset");
            (
                MnistDataset::synthetic(cfg.train_samples, MnistSplit::Train),
                MnistDataset::synthetic(cfg.test_samples, MnistSplit::Test),
            )
        }
    };
    println!();

    // 2. Device set and trainer
    let devices = CpuDevice::all(cfg.devices);
    let mut trainer = ParallelTrainer::new(build_cnn, &devices, cfg.lr)?;
    trainer.initialize(false)?;

    println!("Devices: {:?}", devices.iter().map(|d| d.name()).collect::<Vec<_>>());
    println!("Architecture:");
    println!("  Conv2d(1->20, 3x3) -> ReLU -> MaxPool(2x2)");
    println!("  Conv2d(20->50, 3x3) -> ReLU -> MaxPool(2x2)");
    println!("  Flatten -> Linear(1250->128) -> ReLU -> Linear(128->10)");
    println!(
        "  Parameters per replica: {}",
        trainer.reference_replica().num_parameters()
    );
    println!("Optimizer: SGD (lr={}, batch size {})", cfg.lr, cfg.batch_size);
    println!();

    // 3. Loaders: normalize pixels, shape for the conv stack, one-hot
    //    the labels.
    let train_config = DataLoaderConfig::default()
        .batch_size(cfg.batch_size)
        .shuffle(true)
        .dtype(DType::F64);
    let test_config = DataLoaderConfig::default()
        .batch_size(cfg.batch_size)
        .shuffle(false)
        .dtype(DType::F64);

    let mut train_loader = DataLoader::<CpuBackend>::new(&train_ds, devices[0], train_config)
        .with_transform(Box::new(Normalize::new(255.0)))
        .with_transform(Box::new(ReshapeFeatures::new(vec![1, 28, 28])))
        .with_transform(Box::new(OneHotEncode::new(10)));

    let mut test_loader = DataLoader::<CpuBackend>::new(&test_ds, devices[0], test_config)
        .with_transform(Box::new(Normalize::new(255.0)))
        .with_transform(Box::new(ReshapeFeatures::new(vec![1, 28, 28])))
        .with_transform(Box::new(OneHotEncode::new(10)));

    println!(
        "Training for {} epochs ({} batches/epoch)...",
        cfg.epochs,
        train_loader.num_batches()
    );
    println!("{:-<60}", "");

    // 4. Epoch loop
    let result = fit(&trainer, &mut train_loader, &mut test_loader, cfg.epochs)?;

    for log in &result.epochs {
        println!(
            "  epoch {}/{} | loss {:.4} | val acc {:5.1}% | {:.2}s",
            log.epoch + 1,
            cfg.epochs,
            log.train_loss,
            log.val_accuracy * 100.0,
            log.elapsed.as_secs_f64()
        );
    }

    println!("{:-<60}", "");
    println!(
        "Final validation accuracy on {} device(s): {:.1}%",
        cfg.devices,
        result.final_accuracy() * 100.0
    );

    Ok(())
}
