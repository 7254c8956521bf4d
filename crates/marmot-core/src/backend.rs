use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend: abstraction over compute devices.
//
// Each backend implements this trait with its own storage and device
// types, and Tensor<B> dispatches every operation through it. A trait
// (rather than a device enum) lets new backends live in separate crates
// and gives each one its own storage representation.
//
// A device handle identifies one compute unit with its own memory. The
// same backend may expose several handles (e.g. cpu:0, cpu:1); tensors
// never move between handles implicitly, which is what makes data-parallel
// replica bookkeeping sound.

/// Identifies a compute device handle (e.g. "cpu:0", "cpu:1").
///
/// Equality means "same handle": two tensors may only be combined when
/// their devices compare equal.
pub trait BackendDevice: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Human-readable name for this handle (e.g. "cpu:0").
    fn name(&self) -> String;

    /// Block until all work queued on this handle has completed.
    ///
    /// Synchronous backends are always caught up; this is the hook the
    /// epoch loop calls before reading the stopwatch.
    fn synchronize(&self) {}
}

/// A storage buffer holding tensor data on one device handle.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Operation enums: they parameterize the backend kernels and are recorded
// in the Op graph, since the backward pass needs to know which op ran.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Square,
    Relu,
}

/// Reduction operations along dimension(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    ArgMax,
}

/// The core interface every backend must implement.
///
/// All operations take storage + layout (shape/strides/offset) and return
/// fresh storage; there is no in-place mutation at this level.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device handle type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    // Creation

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with ones.
    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random normal values (mean 0, std 1).
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Element-wise ops

    /// Apply a binary op element-wise with NumPy-style broadcasting.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Apply a unary op element-wise.
    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Affine transform: result = input * mul + add.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    // Reductions

    /// Reduce along specific dimensions. Empty `dims` reduces everything
    /// to a scalar. ArgMax produces I64 storage.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
    ) -> Result<Self::Storage>;

    // Matrix multiplication

    /// 2-D matrix multiply: C = A @ B with A [m, k] and B [k, n].
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    // Data movement

    /// Make a contiguous copy of the storage following the given layout.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy data to a host Vec<f64> in logical order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Copy storage onto another device handle, producing a contiguous
    /// buffer owned by `device`. Used by the batch splitter to place
    /// shards on their assigned handles.
    fn transfer(
        input: &Self::Storage,
        layout: &Layout,
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    // Concatenation

    /// Concatenate storages along `dim` into one contiguous buffer.
    /// Each entry is (storage, layout) so views are handled correctly.
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;
}
