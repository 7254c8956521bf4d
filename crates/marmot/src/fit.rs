// The epoch loop: train, barrier, time, evaluate.
//
// For each epoch: reset the training iterator and run
// split -> per-shard forward/backward -> step over every batch; then
// synchronize all device handles, read the stopwatch, and measure
// validation accuracy on the reference replica. Errors propagate
// immediately; there is no retry or recovery.

use std::time::Duration;

use marmot_core::backend::{Backend, BackendDevice};
use marmot_core::bail;
use marmot_core::error::Result;

use marmot_data::DataLoader;
use marmot_nn::{correct_predictions, Module};

use crate::parallel::ParallelTrainer;
use crate::stopwatch::Stopwatch;

/// Log for one training epoch.
#[derive(Debug, Clone)]
pub struct EpochLog {
    /// Epoch number (0-indexed).
    pub epoch: usize,
    /// Average training loss per example.
    pub train_loss: f64,
    /// Validation accuracy in [0, 1], measured on the reference replica.
    pub val_accuracy: f64,
    /// Wall time for the epoch's training pass.
    pub elapsed: Duration,
}

/// Summary of a full training run.
#[derive(Debug, Clone)]
pub struct TrainResult {
    /// Per-epoch logs.
    pub epochs: Vec<EpochLog>,
}

impl TrainResult {
    /// Validation accuracy after the final epoch.
    pub fn final_accuracy(&self) -> f64 {
        self.epochs.last().map_or(0.0, |e| e.val_accuracy)
    }
}

impl std::fmt::Display for TrainResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Training complete: {} epochs", self.epochs.len())?;
        for log in &self.epochs {
            writeln!(
                f,
                "  epoch {}: loss {:.4}, val acc {:.1}%, {:.2}s",
                log.epoch + 1,
                log.train_loss,
                log.val_accuracy * 100.0,
                log.elapsed.as_secs_f64()
            )?;
        }
        write!(f, "  final accuracy: {:.1}%", self.final_accuracy() * 100.0)
    }
}

/// Run the training loop for `epochs` epochs.
///
/// The trainer must already be initialized. Each epoch reshuffles the
/// training loader, feeds every batch through `train_step`, waits for
/// all device handles, and then evaluates on the validation loader.
pub fn fit<B: Backend, M: Module<B>>(
    trainer: &ParallelTrainer<B, M>,
    train_loader: &mut DataLoader<'_, B>,
    val_loader: &mut DataLoader<'_, B>,
    epochs: usize,
) -> Result<TrainResult> {
    if !trainer.is_initialized() {
        bail!("fit: trainer is not initialized");
    }

    let mut logs = Vec::with_capacity(epochs);
    let mut watch = Stopwatch::new();

    for epoch in 0..epochs {
        watch.start();

        let mut loss_sum = 0.0;
        let mut examples = 0usize;
        for batch in train_loader.epoch_batches()? {
            loss_sum += trainer.train_step(&batch.input, &batch.target)?;
            examples += batch.input.dims()[0];
        }

        // Full barrier before the clock is read.
        for device in trainer.devices() {
            device.synchronize();
        }
        let elapsed = watch.stop();

        let val_accuracy = evaluate(trainer, val_loader)?;
        let train_loss = if examples > 0 {
            loss_sum / examples as f64
        } else {
            0.0
        };

        log::info!(
            "epoch {}: loss {:.4}, val acc {:.3}, {:.2}s on {} device(s)",
            epoch + 1,
            train_loss,
            val_accuracy,
            elapsed.as_secs_f64(),
            trainer.num_replicas()
        );

        logs.push(EpochLog {
            epoch,
            train_loss,
            val_accuracy,
            elapsed,
        });
    }

    Ok(TrainResult { epochs: logs })
}

/// Validation accuracy of the reference replica over a full epoch of the
/// loader. Batches are moved to the reference device if they are not
/// already there. Returns `correct / num` in [0, 1].
pub fn evaluate<B: Backend, M: Module<B>>(
    trainer: &ParallelTrainer<B, M>,
    loader: &mut DataLoader<'_, B>,
) -> Result<f64> {
    let model = trainer.reference_replica();
    let device = &trainer.devices()[0];

    let mut correct = 0usize;
    let mut total = 0usize;
    for batch in loader.epoch_batches()? {
        let x = batch.input.to_device(device)?;
        let y = batch.target.to_device(device)?;
        let logits = model.forward(&x)?;
        correct += correct_predictions(&logits, &y)?;
        total += x.dims()[0];
    }

    if total == 0 {
        return Ok(0.0);
    }
    Ok(correct as f64 / total as f64)
}
