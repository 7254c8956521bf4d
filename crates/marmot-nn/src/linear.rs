// Linear: fully-connected layer, y = x W^T + b.
//
// weight: [out_features, in_features], stored transposed for the matmul.
// bias:   [1, out_features], broadcast over the batch dimension.
//
// Weights use Kaiming (He) uniform initialization, U(-k, k) with
// k = sqrt(1 / in_features), the standard for layers followed by ReLU.

use marmot_core::backend::Backend;
use marmot_core::dtype::DType;
use marmot_core::error::Result;
use marmot_core::tensor::Tensor;

use crate::module::Module;

/// A fully-connected (dense) layer: y = x W^T + b.
pub struct Linear<B: Backend> {
    /// Weight matrix: [out_features, in_features].
    weight: Tensor<B>,
    /// Optional bias: [1, out_features].
    bias: Option<Tensor<B>>,
    in_features: usize,
    out_features: usize,
}

impl<B: Backend> Linear<B> {
    /// Create a Linear layer with Kaiming-uniform initialization.
    pub fn new(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = (1.0 / in_features as f64).sqrt();

        // rand in [0,1) scaled to [-k, k].
        let weight = Tensor::<B>::rand((out_features, in_features), dtype, device)?
            .affine(2.0 * k, -k)?
            .set_variable();

        let bias = if use_bias {
            let b = Tensor::<B>::rand((1, out_features), dtype, device)?
                .affine(2.0 * k, -k)?
                .set_variable();
            Some(b)
        } else {
            None
        };

        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }
}

impl<B: Backend> Module<B> for Linear<B> {
    /// Input [batch, in_features] to output [batch, out_features].
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let wt = self.weight.t()?.contiguous()?;
        let output = x.matmul(&wt)?;
        match &self.bias {
            Some(bias) => output.add(bias),
            None => Ok(output),
        }
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
