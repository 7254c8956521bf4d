// Op: computational-graph node for automatic differentiation.
//
// Every tensor produced by a computation records how it was created. The
// records form a DAG that backward() walks in reverse to apply the chain
// rule. Each variant stores the actual input Tensor<B> handles (Arc
// clones, so cheap); the graph keeps inputs alive exactly as long as the
// output exists, and dropping the loss tensor releases everything.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Records the operation that produced a tensor.
pub enum Op<B: Backend> {
    /// Leaf tensor: input data or a trainable parameter.
    None,

    /// Element-wise binary: result = op(lhs, rhs).
    Binary {
        lhs: crate::Tensor<B>,
        rhs: crate::Tensor<B>,
        op: BinaryOp,
    },

    /// Element-wise unary: result = op(input).
    Unary {
        input: crate::Tensor<B>,
        op: UnaryOp,
    },

    /// Reduction along `dims` (empty = all elements).
    Reduce {
        input: crate::Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
    },

    /// Matrix multiplication: result = lhs @ rhs.
    Matmul {
        lhs: crate::Tensor<B>,
        rhs: crate::Tensor<B>,
    },

    /// Reshape: same data, different shape. `src_shape` lets backward
    /// reshape the gradient back.
    Reshape {
        input: crate::Tensor<B>,
        src_shape: crate::Shape,
    },

    /// Transpose: swap two dimensions.
    Transpose {
        input: crate::Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// Narrow/slice along a dimension.
    Narrow {
        input: crate::Tensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    },

    /// Affine transform: result = input * mul + add.
    Affine {
        input: crate::Tensor<B>,
        mul: f64,
        add: f64,
    },

    /// Contiguous copy; gradient passes through unchanged.
    Contiguous { input: crate::Tensor<B> },

    /// 2-D convolution: result = conv2d(input, weight) + bias.
    /// input: [N, C_in, H, W], weight: [C_out, C_in, kH, kW].
    Conv2d {
        input: crate::Tensor<B>,
        weight: crate::Tensor<B>,
        bias: Option<crate::Tensor<B>>,
        stride: [usize; 2],
        padding: [usize; 2],
    },

    /// 2-D max-pooling. `indices` stores the argmax positions (flat
    /// indices into the input) for backward.
    MaxPool2d {
        input: crate::Tensor<B>,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        indices: Vec<usize>,
    },

    /// Concatenation along `dim`. `sizes` stores each input's extent along
    /// `dim` so backward can slice the gradient back apart.
    Cat {
        inputs: Vec<crate::Tensor<B>>,
        dim: usize,
        sizes: Vec<usize>,
    },
}

// Manual Clone: derive struggles with the generic, and every clone here is
// just an Arc refcount bump.
impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce { input, op, dims } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
            },
            Op::Matmul { lhs, rhs } => Op::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, dim0, dim1 } => Op::Transpose {
                input: input.clone(),
                dim0: *dim0,
                dim1: *dim1,
            },
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => Op::Narrow {
                input: input.clone(),
                dim: *dim,
                start: *start,
                len: *len,
            },
            Op::Affine { input, mul, add } => Op::Affine {
                input: input.clone(),
                mul: *mul,
                add: *add,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => Op::Conv2d {
                input: input.clone(),
                weight: weight.clone(),
                bias: bias.clone(),
                stride: *stride,
                padding: *padding,
            },
            Op::MaxPool2d {
                input,
                kernel_size,
                stride,
                padding,
                indices,
            } => Op::MaxPool2d {
                input: input.clone(),
                kernel_size: *kernel_size,
                stride: *stride,
                padding: *padding,
                indices: indices.clone(),
            },
            Op::Cat { inputs, dim, sizes } => Op::Cat {
                inputs: inputs.clone(),
                dim: *dim,
                sizes: sizes.clone(),
            },
        }
    }
}

// Concise Debug: op kind and tensor ids only, never full tensor data.
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, id={:?}, id={:?})", op, lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({:?}, id={:?})", op, input.id()),
            Op::Reduce { input, op, dims } => {
                write!(f, "Reduce({:?}, dims={:?}, id={:?})", op, dims, input.id())
            }
            Op::Matmul { lhs, rhs } => write!(f, "Matmul(id={:?}, id={:?})", lhs.id(), rhs.id()),
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape({} -> ?, id={:?})", src_shape, input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({}, {}, id={:?})", dim0, dim1, input.id())
            }
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => write!(
                f,
                "Narrow(dim={}, {}..{}, id={:?})",
                dim,
                start,
                start + len,
                input.id()
            ),
            Op::Affine { input, mul, add } => {
                write!(f, "Affine(*{} +{}, id={:?})", mul, add, input.id())
            }
            Op::Contiguous { input } => write!(f, "Contiguous(id={:?})", input.id()),
            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => write!(
                f,
                "Conv2d(in={:?}, w={:?}, bias={}, s={:?}, p={:?})",
                input.id(),
                weight.id(),
                bias.is_some(),
                stride,
                padding
            ),
            Op::MaxPool2d {
                input,
                kernel_size,
                stride,
                padding,
                ..
            } => write!(
                f,
                "MaxPool2d(in={:?}, k={:?}, s={:?}, p={:?})",
                input.id(),
                kernel_size,
                stride,
                padding
            ),
            Op::Cat { inputs, dim, .. } => {
                let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
                write!(f, "Cat(dim={}, ids={:?})", dim, ids)
            }
        }
    }
}

impl<B: Backend> Op<B> {
    /// References to all input tensors of this operation. Used by the
    /// topological sort in backward().
    pub fn inputs(&self) -> Vec<&crate::Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Narrow { input, .. }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::MaxPool2d { input, .. } => vec![input],
            Op::Conv2d {
                input,
                weight,
                bias,
                ..
            } => {
                let mut v = vec![input, weight];
                if let Some(b) = bias {
                    v.push(b);
                }
                v
            }
            Op::Cat { inputs, .. } => inputs.iter().collect(),
        }
    }
}
