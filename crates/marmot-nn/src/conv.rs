// Conv2d and MaxPool2d.
//
// Conv2d applies learnable 2-D filters to [N, C_in, H, W], producing
// [N, C_out, H_out, W_out] with
//   H_out = (H + 2*pH - kH) / sH + 1.
//
// Weight shape [C_out, C_in, kH, kW], optional bias [C_out]. Kaiming
// uniform init with k = sqrt(1 / (C_in * kH * kW)).

use marmot_core::backend::Backend;
use marmot_core::dtype::DType;
use marmot_core::error::Result;
use marmot_core::shape::Shape;
use marmot_core::tensor::Tensor;

use crate::module::Module;

/// 2-D convolutional layer.
pub struct Conv2d<B: Backend> {
    /// Convolution filters: [C_out, C_in, kH, kW].
    weight: Tensor<B>,
    /// Optional bias: [C_out].
    bias: Option<Tensor<B>>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl<B: Backend> Conv2d<B> {
    /// Create a Conv2d layer with Kaiming-uniform initialization.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let [kh, kw] = kernel_size;
        let fan_in = in_channels * kh * kw;
        let k = (1.0 / fan_in as f64).sqrt();

        let weight = Tensor::<B>::rand(
            Shape::new(vec![out_channels, in_channels, kh, kw]),
            dtype,
            device,
        )?
        .affine(2.0 * k, -k)?
        .set_variable();

        let bias = if use_bias {
            let b = Tensor::<B>::rand(Shape::new(vec![out_channels]), dtype, device)?
                .affine(2.0 * k, -k)?
                .set_variable();
            Some(b)
        } else {
            None
        };

        Ok(Conv2d {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
    pub fn kernel_size(&self) -> [usize; 2] {
        self.kernel_size
    }
    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }
    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }
}

impl<B: Backend> Module<B> for Conv2d<B> {
    /// `[N, C_in, H, W]` to `[N, C_out, H_out, W_out]`.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.conv2d(&self.weight, self.bias.as_ref(), self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            params.push(b.clone());
        }
        params
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = vec![("weight".to_string(), self.weight.clone())];
        if let Some(ref b) = self.bias {
            named.push(("bias".to_string(), b.clone()));
        }
        named
    }
}

// MaxPool2d

/// 2-D max-pooling layer: slides a window over the spatial dimensions and
/// keeps the maximum of each window. No learnable parameters.
pub struct MaxPool2d {
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

impl MaxPool2d {
    /// Create a MaxPool2d layer. `stride` is typically the kernel size.
    pub fn new(kernel_size: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Self {
        MaxPool2d {
            kernel_size,
            stride,
            padding,
        }
    }
}

impl<B: Backend> Module<B> for MaxPool2d {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.max_pool2d(self.kernel_size, self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
