//! # marmot-nn
//!
//! Neural network layers, losses, and metrics for Marmot.
//!
//! Every layer implements the [`Module`] trait and is generic over the
//! backend, so one network definition runs on any device handle. The set
//! here is the convolutional-classifier family: Conv2d, MaxPool2d,
//! Flatten, Linear, ReLU, and a Sequential container, plus softmax
//! cross-entropy and argmax accuracy.

pub mod activation;
pub mod conv;
pub mod flatten;
pub mod linear;
pub mod loss;
pub mod metrics;
pub mod module;
pub mod sequential;

pub use activation::ReLU;
pub use conv::{Conv2d, MaxPool2d};
pub use flatten::Flatten;
pub use linear::Linear;
pub use loss::{softmax_cross_entropy, Reduction};
pub use metrics::{accuracy, correct_predictions};
pub use module::Module;
pub use sequential::Sequential;

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::DType;
    use marmot_cpu::{CpuBackend, CpuDevice};

    const DEV: CpuDevice = CpuDevice::new(0);

    #[test]
    fn test_linear_forward_shape() {
        let linear = Linear::<CpuBackend>::new(4, 2, true, DType::F64, &DEV).unwrap();
        let x = marmot_core::Tensor::rand((6, 4), DType::F64, &DEV).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.dims(), &[6, 2]);
        assert_eq!(linear.num_parameters(), 4 * 2 + 2);
    }

    #[test]
    fn test_conv_pool_stack_shapes() {
        // 28x28 through two conv(3x3)+pool(2x2) blocks lands on 5x5.
        let net = Sequential::<CpuBackend>::new()
            .add(Conv2d::new(1, 4, [3, 3], [1, 1], [0, 0], true, DType::F64, &DEV).unwrap())
            .add(ReLU)
            .add(MaxPool2d::new([2, 2], [2, 2], [0, 0]))
            .add(Conv2d::new(4, 8, [3, 3], [1, 1], [0, 0], true, DType::F64, &DEV).unwrap())
            .add(ReLU)
            .add(MaxPool2d::new([2, 2], [2, 2], [0, 0]))
            .add(Flatten::default())
            .add(Linear::new(8 * 5 * 5, 16, true, DType::F64, &DEV).unwrap())
            .add(ReLU)
            .add(Linear::new(16, 10, true, DType::F64, &DEV).unwrap());

        let x = marmot_core::Tensor::rand((2, 1, 28, 28), DType::F64, &DEV).unwrap();
        let logits = net.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[2, 10]);
    }

    #[test]
    fn test_sequential_parameter_order_is_stable() {
        let build = || {
            Sequential::<CpuBackend>::new()
                .add(Linear::new(3, 4, true, DType::F64, &DEV).unwrap())
                .add(ReLU)
                .add(Linear::new(4, 2, false, DType::F64, &DEV).unwrap())
        };
        let a = build();
        let b = build();
        let pa = a.parameters();
        let pb = b.parameters();
        assert_eq!(pa.len(), pb.len());
        for (x, y) in pa.iter().zip(pb.iter()) {
            assert_eq!(x.dims(), y.dims());
        }
    }

    #[test]
    fn test_gradients_reach_all_parameters() {
        let net = Sequential::<CpuBackend>::new()
            .add(Linear::new(4, 8, true, DType::F64, &DEV).unwrap())
            .add(ReLU)
            .add(Linear::new(8, 3, true, DType::F64, &DEV).unwrap());

        let x = marmot_core::Tensor::rand((2, 4), DType::F64, &DEV).unwrap();
        let target =
            marmot_core::Tensor::from_f64_slice(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], (2, 3), DType::F64, &DEV)
                .unwrap();
        let logits = net.forward(&x).unwrap();
        let loss = softmax_cross_entropy(&logits, &target, Reduction::Sum).unwrap();
        let grads = loss.backward().unwrap();

        for p in net.parameters() {
            let g = grads.get(&p);
            assert!(g.is_some(), "missing gradient for {:?}", p);
            assert_eq!(g.unwrap().dims(), p.dims());
        }
    }
}
