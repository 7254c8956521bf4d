use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BackendDevice, BinaryOp, ReduceOp, UnaryOp};
use crate::bail;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor: the fundamental data structure.
//
// A Tensor is an n-dimensional array that
//   1. lives on exactly one device handle (the device is part of its
//      identity; ops refuse to mix handles),
//   2. has a shape and a dtype,
//   3. records the operation that created it, for autograd.
//
// Tensor<B: Backend> is generic over the backend, so the same code runs
// against any device implementation.
//
// MEMORY MODEL: the handle is Arc-wrapped, so cloning a Tensor is O(1).
// Storage sits behind Arc<RwLock<..>> so views (transpose, narrow) share
// bytes, many readers can run concurrently, and the optimizer can write
// updated parameter values in place. That in-place write is what keeps a
// live model layer and its optimizer looking at the same numbers.

/// Inner data of a tensor, shared via Arc.
struct TensorInner<B: Backend> {
    /// Unique identifier (key in the autograd gradient store).
    id: TensorId,
    /// Raw data on the owning device.
    storage: Arc<RwLock<B::Storage>>,
    /// Memory layout: shape + strides + offset.
    layout: Layout,
    /// Element type.
    dtype: DType,
    /// The device handle this tensor is owned by.
    device: B::Device,
    /// The operation that created this tensor. Op::None for leaves.
    op: Op<B>,
    /// Whether this tensor is a trainable variable. Only variables
    /// receive gradients from backward().
    is_variable: bool,
}

/// An n-dimensional array on a specific device handle.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device.name(),
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    /// A view sharing the same storage under a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// The dimensions as a slice.
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The device handle that owns this tensor.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// The memory layout (shape + strides + offset).
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Whether this tensor is contiguous in memory.
    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether this tensor receives gradients.
    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    /// Operands must live on the same device handle.
    fn check_same_device(&self, rhs: &Self) -> Result<()> {
        if self.device() != rhs.device() {
            return Err(Error::DeviceMismatch {
                lhs: self.device().name(),
                rhs: rhs.device().name(),
            });
        }
        Ok(())
    }

    // In-place mutation

    /// Overwrite the underlying storage with new values.
    ///
    /// The write goes through the shared `Arc<RwLock<..>>`, so every other
    /// tensor sharing this storage (e.g. the clone a layer holds) sees the
    /// update. This is how optimizer steps become visible to live models
    /// without rebuilding them.
    ///
    /// The new data must have the same element count; shape is unchanged.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            bail!(
                "update_data_inplace: expected {} elements, got {}",
                expected,
                new_data.len()
            );
        }
        let new_storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self.write_storage()?;
        *guard = new_storage;
        Ok(())
    }

    // Creation

    /// Tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor filled with a constant value.
    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor from a flat slice of f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let layout = Layout::contiguous(shape);
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor with random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Tensor with random normal values (mean 0, std 1).
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Zeros with the same shape, dtype, and device as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    /// Mark this tensor as a trainable variable. Variables receive
    /// gradients from backward().
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: self.inner.op.clone(),
                is_variable: true,
            }),
        }
    }

    /// Detached copy: same data, no gradient history, fresh id.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }

    // Shape manipulation (views; no data copy)

    /// Transpose two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Transpose a 2-D matrix (shorthand for transpose(0, 1)).
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Narrow (slice) along a dimension.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let new_layout = self.inner.layout.narrow(dim, start, len)?;
        let op = Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Reshape to a new shape with the same element count. Non-contiguous
    /// tensors are made contiguous first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        let tensor = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        let src_shape = tensor.shape().clone();
        let new_layout = Layout::contiguous(new_shape);
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape,
        };
        Ok(tensor.view_with_layout(new_layout, op))
    }

    /// Ensure the tensor is contiguous in memory. Already-contiguous
    /// tensors return a cheap clone.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        let new_layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            new_storage,
            new_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    /// Split into `n` chunks along a dimension, each of size ceil(d/n);
    /// the final chunk is smaller when the dimension is not divisible.
    pub fn chunk(&self, n: usize, dim: usize) -> Result<Vec<Self>> {
        if n == 0 {
            bail!("chunk: n must be > 0");
        }
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        let dim_size = self.dims()[dim];
        let chunk_size = dim_size.div_ceil(n);
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < dim_size {
            let len = chunk_size.min(dim_size - start);
            chunks.push(self.narrow(dim, start, len)?);
            start += len;
        }
        Ok(chunks)
    }

    /// Concatenate tensors along a dimension. All tensors must share a
    /// device, a dtype, and every dimension except `dim`.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        if tensors.is_empty() {
            bail!("cat: empty tensor list");
        }
        if tensors.len() == 1 {
            return Ok(tensors[0].clone());
        }

        let first = &tensors[0];
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }

        for (i, t) in tensors.iter().enumerate().skip(1) {
            first.check_same_device(t)?;
            if t.rank() != rank {
                bail!("cat: tensor {} has rank {} but expected {}", i, t.rank(), rank);
            }
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            for d in 0..rank {
                if d != dim && t.dims()[d] != first.dims()[d] {
                    bail!(
                        "cat: tensor {} has size {} at dim {} but expected {}",
                        i,
                        t.dims()[d],
                        d,
                        first.dims()[d]
                    );
                }
            }
        }

        let cat_size: usize = tensors.iter().map(|t| t.dims()[dim]).sum();
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = cat_size;
        let out_shape = Shape::new(out_dims);

        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[dim]).collect();

        let guards: Vec<_> = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<Vec<_>>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (&*guards[i], &t.inner.layout))
            .collect();

        let storage = B::cat(&pairs, &out_shape, dim)?;
        let layout = Layout::contiguous(out_shape);
        let op = Op::Cat {
            inputs: tensors.to_vec(),
            dim,
            sizes,
        };
        Ok(Self::from_storage(
            storage,
            layout,
            first.dtype(),
            first.device().clone(),
            op,
        ))
    }

    // Arithmetic

    /// Element-wise addition (broadcasting).
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise subtraction (broadcasting).
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise multiplication (broadcasting).
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise division (broadcasting).
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        self.check_same_device(rhs)?;
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::binary_op(
            op,
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;
        let result_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let result_layout = Layout::contiguous(result_shape);
        let result_op = Op::Binary {
            lhs: self.clone(),
            rhs: rhs.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Unary ops

    /// Element-wise negation.
    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    /// Element-wise exponential.
    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    /// Element-wise square.
    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    /// ReLU activation: max(0, x).
    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::unary_op(op, &storage, &self.inner.layout)?;
        let result_layout = Layout::contiguous(self.shape().clone());
        let result_op = Op::Unary {
            input: self.clone(),
            op,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    /// Affine transform: result = self * mul + add.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = self.read_storage()?;
        let result = B::affine(&storage, &self.inner.layout, mul, add)?;
        let result_layout = Layout::contiguous(self.shape().clone());
        let result_op = Op::Affine {
            input: self.clone(),
            mul,
            add,
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Reductions

    /// Sum of all elements as a scalar tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    /// Sum along one dimension.
    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    /// Mean of all elements as a scalar tensor.
    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    /// Max along one dimension.
    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[dim], keep_dim)
    }

    /// ArgMax along one dimension (I64 indices).
    pub fn argmax(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::ArgMax, &[dim], keep_dim)
    }

    fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        let storage = self.read_storage()?;
        let result = B::reduce_op(op, &storage, &self.inner.layout, dims)?;

        let result_shape = if dims.is_empty() {
            Shape::from(())
        } else if keep_dim {
            let mut new_dims = self.dims().to_vec();
            for &d in dims {
                new_dims[d] = 1;
            }
            Shape::new(new_dims)
        } else {
            let new_dims: Vec<usize> = self
                .dims()
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &d)| d)
                .collect();
            if new_dims.is_empty() {
                Shape::from(())
            } else {
                Shape::new(new_dims)
            }
        };

        let result_layout = Layout::contiguous(result_shape);
        let result_dtype = match op {
            ReduceOp::ArgMax => DType::I64,
            _ => self.inner.dtype,
        };
        let result_op = Op::Reduce {
            input: self.clone(),
            op,
            dims: dims.to_vec(),
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            result_dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Matrix multiplication

    /// 2-D matrix multiplication: [m, k] @ [k, n] -> [m, n].
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.check_same_device(rhs)?;
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if self.rank() != 2 || rhs.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let (m, k1) = (self.dims()[0], self.dims()[1]);
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }

        let storage_lhs = self.read_storage()?;
        let storage_rhs = rhs.read_storage()?;
        let result = B::matmul(
            &storage_lhs,
            &self.inner.layout,
            &storage_rhs,
            &rhs.inner.layout,
        )?;

        let result_layout = Layout::contiguous(Shape::from((m, n)));
        let result_op = Op::Matmul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        Ok(Self::from_storage(
            result,
            result_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Composite operations (built from differentiable primitives)

    /// Softmax along a dimension, shifted by the (detached) row max for
    /// numerical stability.
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let max_val = self.max(dim, true)?.detach();
        let shifted = self.sub(&max_val)?;
        let exp_x = shifted.exp()?;
        let sum_exp = exp_x.sum(dim, true)?;
        exp_x.div(&sum_exp)
    }

    /// Numerically stable log-softmax:
    /// `log_softmax(x)_i = x_i - max(x) - log(sum(exp(x - max(x))))`.
    pub fn log_softmax(&self, dim: usize) -> Result<Self> {
        let max_val = self.max(dim, true)?.detach();
        let shifted = self.sub(&max_val)?;
        let exp_x = shifted.exp()?;
        let sum_exp = exp_x.sum(dim, true)?;
        let log_sum_exp = sum_exp.log()?;
        shifted.sub(&log_sum_exp)
    }

    // 2-D convolution

    /// 2-D convolution.
    ///
    /// - `self` (input): `[N, C_in, H, W]`
    /// - `weight`:       `[C_out, C_in, kH, kW]`
    /// - `bias`:         optional `[C_out]`
    ///
    /// Output: `[N, C_out, H_out, W_out]` with
    /// `H_out = (H + 2*pH - kH) / sH + 1`.
    pub fn conv2d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        self.check_same_device(weight)?;
        if let Some(b) = bias {
            self.check_same_device(b)?;
        }
        if self.rank() != 4 {
            bail!("conv2d input must be 4D [N,C,H,W], got rank {}", self.rank());
        }
        if weight.rank() != 4 {
            bail!(
                "conv2d weight must be 4D [C_out,C_in,kH,kW], got rank {}",
                weight.rank()
            );
        }

        let in_dims = self.dims();
        let w_dims = weight.dims();
        let (n, c_in, h, w) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
        let (c_out, wc_in, kh, kw) = (w_dims[0], w_dims[1], w_dims[2], w_dims[3]);

        if c_in != wc_in {
            bail!("conv2d: input channels {} != weight channels {}", c_in, wc_in);
        }

        let [sh, sw] = stride;
        let [ph, pw] = padding;

        if h + 2 * ph < kh || w + 2 * pw < kw {
            bail!("conv2d: kernel larger than padded input");
        }

        let h_out = (h + 2 * ph - kh) / sh + 1;
        let w_out = (w + 2 * pw - kw) / sw + 1;

        let input_data = self.contiguous()?.to_f64_vec()?;
        let weight_data = weight.contiguous()?.to_f64_vec()?;
        let bias_data = match bias {
            Some(b) => Some(b.contiguous()?.to_f64_vec()?),
            None => None,
        };

        let out_size = n * c_out * h_out * w_out;
        let mut output = vec![0.0f64; out_size];

        // im2col + GEMM per sample: unroll input patches into columns
        // [C_in*kH*kW, H_out*W_out], then weight [C_out, C_in*kH*kW] times
        // columns gives this sample's output.
        let col_rows = c_in * kh * kw;
        let col_cols = h_out * w_out;
        let mut columns = vec![0.0f64; col_rows * col_cols];
        let sample_size = c_in * h * w;

        for ni in 0..n {
            let in_offset = ni * sample_size;
            im2col(
                &input_data[in_offset..in_offset + sample_size],
                c_in,
                h,
                w,
                kh,
                kw,
                sh,
                sw,
                ph,
                pw,
                h_out,
                w_out,
                &mut columns,
            );

            let out_offset = ni * c_out * col_cols;
            gemm(
                &weight_data,
                &columns,
                &mut output[out_offset..out_offset + c_out * col_cols],
                c_out,
                col_cols,
                col_rows,
            );

            if let Some(ref bd) = bias_data {
                for co in 0..c_out {
                    let row_start = out_offset + co * col_cols;
                    for j in 0..col_cols {
                        output[row_start + j] += bd[co];
                    }
                }
            }
        }

        let result_shape = Shape::new(vec![n, c_out, h_out, w_out]);
        let result_op = Op::Conv2d {
            input: self.clone(),
            weight: weight.clone(),
            bias: bias.cloned(),
            stride,
            padding,
        };
        let storage = B::from_f64_slice(&output, self.dtype(), self.device())?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // 2-D max pooling

    /// 2-D max pooling over a 4-D input `[N, C, H, W]`. The argmax
    /// positions are saved in the op record for backward.
    pub fn max_pool2d(
        &self,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        if self.rank() != 4 {
            bail!(
                "max_pool2d input must be 4D [N,C,H,W], got rank {}",
                self.rank()
            );
        }

        let dims = self.dims();
        let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        let [kh, kw] = kernel_size;
        let [sh, sw] = stride;
        let [ph, pw] = padding;

        if h + 2 * ph < kh || w + 2 * pw < kw {
            bail!("max_pool2d: kernel larger than padded input");
        }

        let h_out = (h + 2 * ph - kh) / sh + 1;
        let w_out = (w + 2 * pw - kw) / sw + 1;

        let input_data = self.contiguous()?.to_f64_vec()?;
        let out_size = n * c * h_out * w_out;
        let mut output = vec![f64::NEG_INFINITY; out_size];
        let mut indices = vec![0usize; out_size];

        for ni in 0..n {
            for ci in 0..c {
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let out_idx = ((ni * c + ci) * h_out + oh) * w_out + ow;
                        let mut max_val = f64::NEG_INFINITY;
                        let mut max_idx = 0usize;
                        for ki in 0..kh {
                            for kj in 0..kw {
                                let ih = (oh * sh + ki) as isize - ph as isize;
                                let iw = (ow * sw + kj) as isize - pw as isize;
                                if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                                    let in_idx =
                                        ((ni * c + ci) * h + ih as usize) * w + iw as usize;
                                    if input_data[in_idx] > max_val {
                                        max_val = input_data[in_idx];
                                        max_idx = in_idx;
                                    }
                                }
                            }
                        }
                        output[out_idx] = max_val;
                        indices[out_idx] = max_idx;
                    }
                }
            }
        }

        let result_shape = Shape::new(vec![n, c, h_out, w_out]);
        let result_op = Op::MaxPool2d {
            input: self.clone(),
            kernel_size,
            stride,
            padding,
            indices,
        };
        let storage = B::from_f64_slice(&output, self.dtype(), self.device())?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            result_op,
        ))
    }

    // Data extraction

    /// All elements as a flat Vec<f64> in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// Extract a scalar value (tensor must have exactly one element).
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        let vec = self.to_f64_vec()?;
        Ok(vec[0])
    }

    // Device movement

    /// Copy this tensor onto another device handle.
    ///
    /// The copy is a detached leaf: device transfers never carry gradient
    /// history, since each replica's graph is local to its own handle.
    /// Transferring to the current device returns a cheap clone.
    pub fn to_device(&self, device: &B::Device) -> Result<Self> {
        if self.device() == device {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::transfer(&storage, &self.inner.layout, device)?;
        Ok(Self::from_storage(
            new_storage,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            device.clone(),
            Op::None,
        ))
    }

    // Autograd

    /// Reverse-mode differentiation from a scalar tensor. Returns a
    /// GradStore with gradients for every variable in the graph.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }
}

// im2col / col2im: convolution as matrix multiplication.
//
// im2col extracts every sliding-window patch into the columns of a matrix
// so the convolution becomes one GEMM. col2im is the inverse scatter used
// by the backward pass, accumulating overlapping contributions.

/// Extract sliding-window patches from one sample `[C_in, H, W]` into
/// columns `[C_in * kH * kW, H_out * W_out]`.
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn im2col(
    input: &[f64],
    c_in: usize,
    h: usize,
    w: usize,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    h_out: usize,
    w_out: usize,
    columns: &mut [f64],
) {
    let col_cols = h_out * w_out;
    for ci in 0..c_in {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                let row_offset = row * col_cols;
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        let iw = (ow * sw + kj) as isize - pw as isize;
                        let val = if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                            input[(ci * h + ih as usize) * w + iw as usize]
                        } else {
                            0.0
                        };
                        columns[row_offset + oh * w_out + ow] = val;
                    }
                }
            }
        }
    }
}

/// Scatter columns back into an image buffer, accumulating into `output`
/// (which must be zeroed by the caller).
#[inline]
#[allow(clippy::too_many_arguments)]
pub(crate) fn col2im(
    columns: &[f64],
    c_in: usize,
    h: usize,
    w: usize,
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    h_out: usize,
    w_out: usize,
    output: &mut [f64],
) {
    let col_cols = h_out * w_out;
    for ci in 0..c_in {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (ci * kh + ki) * kw + kj;
                let row_offset = row * col_cols;
                for oh in 0..h_out {
                    for ow in 0..w_out {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        let iw = (ow * sw + kj) as isize - pw as isize;
                        if ih >= 0 && ih < h as isize && iw >= 0 && iw < w as isize {
                            output[(ci * h + ih as usize) * w + iw as usize] +=
                                columns[row_offset + oh * w_out + ow];
                        }
                    }
                }
            }
        }
    }
}

/// C += A x B with A [m, k], B [k, n], C [m, n], all row-major.
#[inline]
pub(crate) fn gemm(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[a_row + p];
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] += a_val * b[b_row + j];
            }
        }
    }
}

/// C += A^T x B with A [k, m], B [k, n], C [m, n].
#[inline]
pub(crate) fn gemm_at_b(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let c_row = i * n;
        for p in 0..k {
            let a_val = a[p * m + i];
            let b_row = p * n;
            for j in 0..n {
                c[c_row + j] += a_val * b[b_row + j];
            }
        }
    }
}

/// C += A x B^T with A [m, k], B [n, k], C [m, n].
#[inline]
pub(crate) fn gemm_a_bt(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = i * k;
        let c_row = i * n;
        for j in 0..n {
            let b_row = j * k;
            let mut val = 0.0f64;
            for p in 0..k {
                val += a[a_row + p] * b[b_row + p];
            }
            c[c_row + j] += val;
        }
    }
}
