// Classification metrics.

use marmot_core::backend::Backend;
use marmot_core::error::Result;
use marmot_core::tensor::Tensor;

/// Count of predictions whose argmax matches the one-hot target's argmax.
///
/// `logits` and `target` are both `[batch, num_classes]`. Returns the raw
/// count so callers can accumulate `correct / num` across batches of
/// different sizes.
pub fn correct_predictions<B: Backend>(
    logits: &Tensor<B>,
    target: &Tensor<B>,
) -> Result<usize> {
    let pred = logits.argmax(1, false)?.to_f64_vec()?;
    let truth = target.argmax(1, false)?.to_f64_vec()?;
    Ok(pred
        .iter()
        .zip(truth.iter())
        .filter(|(p, t)| p == t)
        .count())
}

/// Argmax classification accuracy in [0, 1].
pub fn accuracy<B: Backend>(logits: &Tensor<B>, target: &Tensor<B>) -> Result<f64> {
    let batch = logits.dims()[0];
    if batch == 0 {
        return Ok(0.0);
    }
    let correct = correct_predictions(logits, target)?;
    Ok(correct as f64 / batch as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::DType;
    use marmot_cpu::{CpuDevice, CpuTensor};

    const DEV: CpuDevice = CpuDevice::new(0);

    #[test]
    fn test_accuracy_bounds() {
        // 1 of 2 correct.
        let logits = CpuTensor::from_f64_slice(
            &[5.0, 0.0, 0.0, 0.0, 5.0, 0.0],
            (2, 3),
            DType::F64,
            &DEV,
        )
        .unwrap();
        let target =
            CpuTensor::from_f64_slice(&[1.0, 0.0, 0.0, 0.0, 0.0, 1.0], (2, 3), DType::F64, &DEV)
                .unwrap();
        let acc = accuracy(&logits, &target).unwrap();
        assert!((acc - 0.5).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&acc));
    }

    #[test]
    fn test_all_correct() {
        let logits =
            CpuTensor::from_f64_slice(&[9.0, 0.0, 0.0, 9.0], (2, 2), DType::F64, &DEV).unwrap();
        let target =
            CpuTensor::from_f64_slice(&[1.0, 0.0, 0.0, 1.0], (2, 2), DType::F64, &DEV).unwrap();
        assert_eq!(correct_predictions(&logits, &target).unwrap(), 2);
        assert_eq!(accuracy(&logits, &target).unwrap(), 1.0);
    }
}
