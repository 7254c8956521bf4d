// Loss functions.
//
// softmax_cross_entropy is the classification loss: log-softmax over the
// class dimension, dotted with the one-hot target, negated. It is built
// entirely from differentiable tensor ops, so backward() needs no special
// handling.
//
// The reduction matters for data-parallel training: each shard computes a
// SUM over its examples and the trainer divides once by the effective
// batch size, so the update is independent of how the batch was sharded.

use marmot_core::backend::Backend;
use marmot_core::error::Result;
use marmot_core::tensor::Tensor;

/// How per-example losses are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// Average over all examples (default).
    #[default]
    Mean,
    /// Sum over all examples.
    Sum,
    /// Per-example losses, no reduction.
    None,
}

/// Softmax cross-entropy over one-hot targets.
///
/// # Arguments
/// - `logits`: raw scores `[batch, num_classes]` (not softmax-ed)
/// - `target`: one-hot targets `[batch, num_classes]`
/// - `reduction`: how to aggregate the per-example losses
///
/// Uses `log_softmax` (max-shifted) for numerical stability. With
/// `Reduction::None` the result has shape `[batch]`; otherwise it is a
/// scalar ready for `backward()`.
pub fn softmax_cross_entropy<B: Backend>(
    logits: &Tensor<B>,
    target: &Tensor<B>,
    reduction: Reduction,
) -> Result<Tensor<B>> {
    let dims = logits.dims();
    if dims.len() != 2 {
        return Err(marmot_core::Error::msg(format!(
            "softmax_cross_entropy expects 2D logits [batch, classes], got {:?}",
            dims
        )));
    }

    let log_sm = logits.log_softmax(1)?;
    let prod = target.mul(&log_sm)?;
    let per_example = prod.sum(1, false)?.neg()?; // [batch]

    match reduction {
        Reduction::Mean => per_example.mean_all(),
        Reduction::Sum => per_example.sum_all(),
        Reduction::None => Ok(per_example),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::DType;
    use marmot_cpu::{CpuDevice, CpuTensor};

    const DEV: CpuDevice = CpuDevice::new(0);

    #[test]
    fn test_uniform_logits_loss() {
        // Uniform logits over C classes give loss ln(C) per example.
        let logits = CpuTensor::zeros((4, 10), DType::F64, &DEV).unwrap();
        let mut one_hot = vec![0.0; 40];
        for b in 0..4 {
            one_hot[b * 10 + b] = 1.0;
        }
        let target = CpuTensor::from_f64_slice(&one_hot, (4, 10), DType::F64, &DEV).unwrap();

        let loss = softmax_cross_entropy(&logits, &target, Reduction::Mean).unwrap();
        let v = loss.to_scalar_f64().unwrap();
        assert!((v - (10.0f64).ln()).abs() < 1e-10, "got {v}");
    }

    #[test]
    fn test_sum_is_batch_times_mean() {
        let logits = CpuTensor::from_f64_slice(
            &[2.0, 0.0, 0.0, 0.0, 3.0, 0.0],
            (2, 3),
            DType::F64,
            &DEV,
        )
        .unwrap();
        let target =
            CpuTensor::from_f64_slice(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], (2, 3), DType::F64, &DEV)
                .unwrap();

        let mean = softmax_cross_entropy(&logits, &target, Reduction::Mean)
            .unwrap()
            .to_scalar_f64()
            .unwrap();
        let sum = softmax_cross_entropy(&logits, &target, Reduction::Sum)
            .unwrap()
            .to_scalar_f64()
            .unwrap();
        assert!((sum - 2.0 * mean).abs() < 1e-10);
    }

    #[test]
    fn test_gradient_direction() {
        // The gradient of CE w.r.t. logits is softmax(logits) - target:
        // negative at the true class, positive elsewhere.
        let logits = CpuTensor::zeros((1, 3), DType::F64, &DEV)
            .unwrap()
            .set_variable();
        let target =
            CpuTensor::from_f64_slice(&[1.0, 0.0, 0.0], (1, 3), DType::F64, &DEV).unwrap();
        let loss = softmax_cross_entropy(&logits, &target, Reduction::Sum).unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(&logits).unwrap().to_f64_vec().unwrap();
        assert!((g[0] - (1.0 / 3.0 - 1.0)).abs() < 1e-10);
        assert!((g[1] - 1.0 / 3.0).abs() < 1e-10);
        assert!((g[2] - 1.0 / 3.0).abs() < 1e-10);
    }
}
