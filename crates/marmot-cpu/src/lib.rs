//! # marmot-cpu
//!
//! CPU backend for Marmot.
//!
//! The backend exposes *ordinal* device handles (`cpu:0`, `cpu:1`, ...):
//! one process can hold an ordered set of logical devices, each owning its
//! tensors, which is what the data-parallel trainer replicates across.
//! Handles with different ordinals behave like distinct accelerators as
//! far as tensor identity is concerned; kernels execute synchronously on
//! the calling thread (matmul fans out over rayon).

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use marmot_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use marmot_core::{DType, Error, Layout, Result, Shape, Tensor};

/// A logical CPU device handle.
///
/// Handles are cheap value types; two handles are the same device exactly
/// when their ordinals match. `CpuDevice::all(n)` builds the ordered
/// device set the trainer shards over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDevice {
    ordinal: usize,
}

impl CpuDevice {
    /// Handle for the logical device with the given ordinal.
    pub const fn new(ordinal: usize) -> Self {
        CpuDevice { ordinal }
    }

    /// The ordinal of this handle.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// The ordered set of the first `n` logical devices.
    pub fn all(n: usize) -> Vec<CpuDevice> {
        (0..n).map(CpuDevice::new).collect()
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        CpuDevice::new(0)
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        format!("cpu:{}", self.ordinal)
    }

    // CPU kernels run synchronously, so the default no-op synchronize()
    // already means "all work complete".
}

/// CPU storage: one dense Vec per element type.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    I64(Vec<i64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

/// The CPU backend marker type.
#[derive(Debug, Clone)]
pub struct CpuBackend;

/// Tensor specialized to the CPU backend.
pub type CpuTensor = Tensor<CpuBackend>;

// Kernel helpers. Values are staged through f64: every storage walk goes
// through the layout's strided iterator so views never need a copy first.

/// Read storage in logical order as f64, following the layout.
fn gather(storage: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
    let indices = layout.strided_indices();
    let out = match storage {
        CpuStorage::F32(v) => indices.map(|i| v[i] as f64).collect(),
        CpuStorage::F64(v) => indices.map(|i| v[i]).collect(),
        CpuStorage::U8(v) => indices.map(|i| v[i] as f64).collect(),
        CpuStorage::I64(v) => indices.map(|i| v[i] as f64).collect(),
    };
    Ok(out)
}

/// Pack f64 values into a dense storage of the given dtype.
fn pack(data: &[f64], dtype: DType) -> CpuStorage {
    match dtype {
        DType::F32 => CpuStorage::F32(data.iter().map(|&v| v as f32).collect()),
        DType::F64 => CpuStorage::F64(data.to_vec()),
        DType::U8 => CpuStorage::U8(data.iter().map(|&v| v as u8).collect()),
        DType::I64 => CpuStorage::I64(data.iter().map(|&v| v as i64).collect()),
    }
}

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
    }
}

fn apply_unary(op: UnaryOp, v: f64) -> f64 {
    match op {
        UnaryOp::Neg => -v,
        UnaryOp::Exp => v.exp(),
        UnaryOp::Log => v.ln(),
        UnaryOp::Square => v * v,
        UnaryOp::Relu => v.max(0.0),
    }
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(pack(&vec![0.0; shape.elem_count()], dtype))
    }

    fn ones(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(pack(&vec![1.0; shape.elem_count()], dtype))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(pack(&vec![val; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(pack(data, dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Ok(pack(&data, dtype))
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        Ok(pack(&data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
        let a = gather(lhs, lhs_layout)?;
        let b = gather(rhs, rhs_layout)?;

        // Fast path: identical shapes pair elements directly.
        if lhs_layout.shape() == rhs_layout.shape() {
            let out: Vec<f64> = a
                .iter()
                .zip(b.iter())
                .map(|(&x, &y)| apply_binary(op, x, y))
                .collect();
            return Ok(pack(&out, lhs.dtype()));
        }

        // Broadcast walk: stride 0 repeats the smaller operand.
        let a_strides = lhs_layout.shape().broadcast_strides(&out_shape);
        let b_strides = rhs_layout.shape().broadcast_strides(&out_shape);
        let out_dims = out_shape.dims().to_vec();
        let total = out_shape.elem_count();

        let mut out = vec![0.0f64; total];
        let mut idx = vec![0usize; out_dims.len()];
        for slot in out.iter_mut() {
            let mut ai = 0;
            let mut bi = 0;
            for (d, &i) in idx.iter().enumerate() {
                ai += i * a_strides[d];
                bi += i * b_strides[d];
            }
            *slot = apply_binary(op, a[ai], b[bi]);

            for d in (0..idx.len()).rev() {
                idx[d] += 1;
                if idx[d] < out_dims[d] {
                    break;
                }
                idx[d] = 0;
            }
        }

        Ok(pack(&out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = gather(input, layout)?;
        let out: Vec<f64> = data.iter().map(|&v| apply_unary(op, v)).collect();
        Ok(pack(&out, input.dtype()))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let data = gather(input, layout)?;
        let out: Vec<f64> = data.iter().map(|&v| v * mul + add).collect();
        Ok(pack(&out, input.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
    ) -> Result<CpuStorage> {
        let data = gather(input, layout)?;
        let in_dims = layout.dims();

        // Reduce everything to a scalar.
        if dims.is_empty() {
            let out = match op {
                ReduceOp::Sum => data.iter().sum::<f64>(),
                ReduceOp::Mean => data.iter().sum::<f64>() / data.len().max(1) as f64,
                ReduceOp::Max => data.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                ReduceOp::ArgMax => {
                    let mut best = 0usize;
                    for (i, &v) in data.iter().enumerate() {
                        if v > data[best] {
                            best = i;
                        }
                    }
                    best as f64
                }
            };
            let dtype = match op {
                ReduceOp::ArgMax => DType::I64,
                _ => input.dtype(),
            };
            return Ok(pack(&[out], dtype));
        }

        // ArgMax needs one unambiguous dimension to index into.
        if op == ReduceOp::ArgMax {
            if dims.len() != 1 {
                return Err(Error::msg("argmax reduces exactly one dimension"));
            }
            let dim = dims[0];
            let dim_size = in_dims[dim];
            let inner: usize = in_dims[dim + 1..].iter().product();
            let outer: usize = in_dims[..dim].iter().product();
            let mut out = vec![0.0f64; outer * inner];
            for o in 0..outer {
                for i in 0..inner {
                    let mut best = 0usize;
                    let mut best_val = f64::NEG_INFINITY;
                    for d in 0..dim_size {
                        let v = data[(o * dim_size + d) * inner + i];
                        if v > best_val {
                            best_val = v;
                            best = d;
                        }
                    }
                    out[o * inner + i] = best as f64;
                }
            }
            return Ok(pack(&out, DType::I64));
        }

        // General Sum/Mean/Max: map each input element to its output slot.
        let in_strides = layout.shape().stride_contiguous();
        let out_dims: Vec<usize> = in_dims
            .iter()
            .enumerate()
            .filter(|(i, _)| !dims.contains(i))
            .map(|(_, &d)| d)
            .collect();
        let out_shape = if out_dims.is_empty() {
            Shape::from(())
        } else {
            Shape::new(out_dims)
        };
        let out_strides = out_shape.stride_contiguous();
        let out_total = out_shape.elem_count();

        let init = match op {
            ReduceOp::Max => f64::NEG_INFINITY,
            _ => 0.0,
        };
        let mut out = vec![init; out_total];
        let reduced_count: f64 = dims.iter().map(|&d| in_dims[d] as f64).product();

        for (flat, &v) in data.iter().enumerate() {
            let mut md = vec![0usize; in_dims.len()];
            let mut rem = flat;
            for i in 0..in_dims.len() {
                if in_strides[i] > 0 {
                    md[i] = rem / in_strides[i];
                    rem %= in_strides[i];
                }
            }
            let mut slot = 0;
            let mut j = 0;
            for (i, &coord) in md.iter().enumerate() {
                if !dims.contains(&i) {
                    if j < out_strides.len() {
                        slot += coord * out_strides[j];
                    }
                    j += 1;
                }
            }
            match op {
                ReduceOp::Sum | ReduceOp::Mean => out[slot] += v,
                ReduceOp::Max => {
                    if v > out[slot] {
                        out[slot] = v;
                    }
                }
                ReduceOp::ArgMax => unreachable!(),
            }
        }

        if op == ReduceOp::Mean {
            for v in out.iter_mut() {
                *v /= reduced_count;
            }
        }

        Ok(pack(&out, input.dtype()))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let ld = lhs_layout.dims();
        let rd = rhs_layout.dims();
        if ld.len() != 2 || rd.len() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: ld.len().min(rd.len()),
            });
        }
        let (m, k) = (ld[0], ld[1]);
        let n = rd[1];

        let a = gather(lhs, lhs_layout)?;
        let b = gather(rhs, rhs_layout)?;

        let mut out = vec![0.0f64; m * n];
        out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            for p in 0..k {
                let a_val = a[i * k + p];
                let b_row = &b[p * n..(p + 1) * n];
                for (j, &bv) in b_row.iter().enumerate() {
                    row[j] += a_val * bv;
                }
            }
        });

        Ok(pack(&out, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = gather(input, layout)?;
        Ok(pack(&data, input.dtype()))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        gather(input, layout)
    }

    fn transfer(input: &CpuStorage, layout: &Layout, _device: &CpuDevice) -> Result<CpuStorage> {
        // Logical devices share the host address space; a transfer is a
        // dense copy that the new handle owns exclusively.
        let data = gather(input, layout)?;
        Ok(pack(&data, input.dtype()))
    }

    fn cat(
        inputs: &[(&CpuStorage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<CpuStorage> {
        let out_dims = out_shape.dims();
        let inner: usize = out_dims[dim + 1..].iter().product();
        let outer: usize = out_dims[..dim].iter().product();

        let gathered: Vec<Vec<f64>> = inputs
            .iter()
            .map(|(s, l)| gather(s, l))
            .collect::<Result<Vec<_>>>()?;

        let mut out = vec![0.0f64; out_shape.elem_count()];
        let mut write = 0usize;
        for o in 0..outer {
            for ((_, layout), data) in inputs.iter().zip(gathered.iter()) {
                let block = layout.dims()[dim] * inner;
                out[write..write + block].copy_from_slice(&data[o * block..(o + 1) * block]);
                write += block;
            }
        }

        Ok(pack(&out, inputs[0].0.dtype()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_core::Error;

    const DEV: CpuDevice = CpuDevice::new(0);

    #[test]
    fn test_device_names() {
        assert_eq!(CpuDevice::new(0).name(), "cpu:0");
        assert_eq!(CpuDevice::new(3).name(), "cpu:3");
        let set = CpuDevice::all(2);
        assert_eq!(set.len(), 2);
        assert_ne!(set[0], set[1]);
    }

    #[test]
    fn test_add() {
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &DEV).unwrap();
        let b = CpuTensor::from_f64_slice(&[10.0, 20.0, 30.0, 40.0], (2, 2), DType::F64, &DEV)
            .unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.to_f64_vec().unwrap(), vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_broadcast_add() {
        // [2,3] + [1,3] broadcasts the row.
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &DEV)
            .unwrap();
        let row = CpuTensor::from_f64_slice(&[10.0, 20.0, 30.0], (1, 3), DType::F64, &DEV).unwrap();
        let c = a.add(&row).unwrap();
        assert_eq!(
            c.to_f64_vec().unwrap(),
            vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
    }

    #[test]
    fn test_device_mismatch_rejected() {
        let d0 = CpuDevice::new(0);
        let d1 = CpuDevice::new(1);
        let a = CpuTensor::ones((2, 2), DType::F64, &d0).unwrap();
        let b = CpuTensor::ones((2, 2), DType::F64, &d1).unwrap();
        match a.add(&b) {
            Err(Error::DeviceMismatch { lhs, rhs }) => {
                assert_eq!(lhs, "cpu:0");
                assert_eq!(rhs, "cpu:1");
            }
            other => panic!("expected DeviceMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_to_device() {
        let d0 = CpuDevice::new(0);
        let d1 = CpuDevice::new(1);
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F32, &d0).unwrap();
        let b = a.to_device(&d1).unwrap();
        assert_eq!(b.device(), &d1);
        assert_eq!(b.to_f64_vec().unwrap(), a.to_f64_vec().unwrap());
        // Same-device transfer is a cheap clone with the same id.
        let c = a.to_device(&d0).unwrap();
        assert_eq!(c.id(), a.id());
    }

    #[test]
    fn test_matmul() {
        // [1,2;3,4] @ [5,6;7,8] = [19,22;43,50]
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &DEV).unwrap();
        let b = CpuTensor::from_f64_slice(&[5.0, 6.0, 7.0, 8.0], (2, 2), DType::F64, &DEV).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_f64_vec().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_transpose_then_matmul() {
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &DEV)
            .unwrap();
        let at = a.t().unwrap(); // [3, 2], non-contiguous view
        assert!(!at.is_contiguous());
        assert_eq!(at.to_f64_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let c = at.matmul(&a).unwrap(); // [3,2] @ [2,3] = [3,3]
        assert_eq!(c.dims(), &[3, 3]);
        let got = c.to_f64_vec().unwrap();
        assert_eq!(got[0], 1.0 * 1.0 + 4.0 * 4.0);
    }

    #[test]
    fn test_chunk_cat_roundtrip() {
        let a = CpuTensor::from_f64_slice(
            &(0..10).map(|v| v as f64).collect::<Vec<_>>(),
            (5, 2),
            DType::F64,
            &DEV,
        )
        .unwrap();
        let chunks = a.chunk(3, 0).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].dims(), &[2, 2]);
        assert_eq!(chunks[2].dims(), &[1, 2]);
        let back = CpuTensor::cat(&chunks, 0).unwrap();
        assert_eq!(back.dims(), a.dims());
        assert_eq!(back.to_f64_vec().unwrap(), a.to_f64_vec().unwrap());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 1.0, 1.0, 1.0], (2, 3), DType::F64, &DEV)
            .unwrap();
        let s = a.softmax(1).unwrap();
        let data = s.to_f64_vec().unwrap();
        let row0: f64 = data[0..3].iter().sum();
        let row1: f64 = data[3..6].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-10);
        assert!((row1 - 1.0).abs() < 1e-10);
        // Uniform logits give uniform probabilities.
        assert!((data[3] - 1.0 / 3.0).abs() < 1e-10);
    }

    #[test]
    fn test_argmax() {
        let a = CpuTensor::from_f64_slice(&[1.0, 5.0, 2.0, 9.0, 0.0, 3.0], (2, 3), DType::F64, &DEV)
            .unwrap();
        let idx = a.argmax(1, false).unwrap();
        assert_eq!(idx.dtype(), DType::I64);
        assert_eq!(idx.to_f64_vec().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_backward_mul() {
        let a = CpuTensor::from_f64_slice(&[2.0], 1, DType::F64, &DEV)
            .unwrap()
            .set_variable();
        let b = CpuTensor::from_f64_slice(&[3.0], 1, DType::F64, &DEV)
            .unwrap()
            .set_variable();
        let c = a.mul(&b).unwrap().sum_all().unwrap();
        let grads = c.backward().unwrap();
        assert_eq!(grads.get(&a).unwrap().to_f64_vec().unwrap(), vec![3.0]);
        assert_eq!(grads.get(&b).unwrap().to_f64_vec().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_backward_relu() {
        let a = CpuTensor::from_f64_slice(&[-1.0, 2.0, -3.0, 4.0], 4, DType::F64, &DEV)
            .unwrap()
            .set_variable();
        let loss = a.relu().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert_eq!(
            grads.get(&a).unwrap().to_f64_vec().unwrap(),
            vec![0.0, 1.0, 0.0, 1.0]
        );
    }

    #[test]
    fn test_backward_broadcast_bias() {
        // y = x + b with b broadcast over the batch: grad_b sums the rows.
        let x = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F64, &DEV)
            .unwrap()
            .set_variable();
        let b = CpuTensor::from_f64_slice(&[10.0, 20.0], (1, 2), DType::F64, &DEV)
            .unwrap()
            .set_variable();
        let loss = x.add(&b).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert_eq!(
            grads.get(&b).unwrap().to_f64_vec().unwrap(),
            vec![2.0, 2.0]
        );
    }

    #[test]
    fn test_conv2d_identity_kernel() {
        // A single 1x1 kernel with weight 1 reproduces the input.
        let x = CpuTensor::from_f64_slice(
            &(0..9).map(|v| v as f64).collect::<Vec<_>>(),
            (1, 1, 3, 3),
            DType::F64,
            &DEV,
        )
        .unwrap();
        let w = CpuTensor::from_f64_slice(&[1.0], (1, 1, 1, 1), DType::F64, &DEV).unwrap();
        let y = x.conv2d(&w, None, [1, 1], [0, 0]).unwrap();
        assert_eq!(y.dims(), &[1, 1, 3, 3]);
        assert_eq!(y.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());
    }

    #[test]
    fn test_conv2d_sum_kernel() {
        // A 2x2 all-ones kernel computes sliding-window sums.
        let x = CpuTensor::from_f64_slice(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
            (1, 1, 3, 3),
            DType::F64,
            &DEV,
        )
        .unwrap();
        let w = CpuTensor::ones((1, 1, 2, 2), DType::F64, &DEV).unwrap();
        let y = x.conv2d(&w, None, [1, 1], [0, 0]).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        assert_eq!(y.to_f64_vec().unwrap(), vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_max_pool2d() {
        let x = CpuTensor::from_f64_slice(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0,
              16.0],
            (1, 1, 4, 4),
            DType::F64,
            &DEV,
        )
        .unwrap();
        let y = x.max_pool2d([2, 2], [2, 2], [0, 0]).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        assert_eq!(y.to_f64_vec().unwrap(), vec![6.0, 8.0, 14.0, 16.0]);
    }
}
