// Backpropagation: reverse-mode automatic differentiation.
//
// The forward pass records a DAG of Ops. backward() topologically sorts
// that DAG from the loss to the leaves, seeds grad(loss) = 1, and walks in
// reverse applying the chain rule per op, accumulating into a GradStore.
//
// ACCUMULATION: a tensor used by several operations receives the SUM of
// the contributions from each use (multivariate chain rule).
//
// Selected rules:
//   Add:      grad_a += g,          grad_b += g
//   Mul:      grad_a += g * b,      grad_b += g * a
//   Matmul:   grad_A += g @ B^T,    grad_B += A^T @ g
//   Sum:      grad_in += broadcast(g)
//   Narrow:   grad_in += scatter(g) at the sliced position
//   Conv2d:   im2col/col2im GEMMs for input, weight, and bias grads
//   MaxPool:  g routed to the saved argmax positions

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::Result;
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Gradients for all tensors in a computation graph, keyed by tensor id.
///
/// Returned by `tensor.backward()`; query with `grads.get(&tensor)`.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    /// Create an empty GradStore.
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// The gradient of a tensor, if one was produced.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    fn get_by_id(&self, id: &TensorId) -> Option<&Tensor<B>> {
        self.grads.get(id)
    }

    /// Accumulate a gradient for a tensor, summing with any existing one.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        if let Some(existing) = self.grads.get(&id) {
            let new_grad = existing.add(&grad)?;
            self.grads.insert(id, new_grad);
        } else {
            self.grads.insert(id, grad);
        }
        Ok(())
    }
}

/// Topological ordering of the graph rooted at `root`: every tensor
/// appears after all of its inputs (leaves first, root last).
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn visit<B: Backend>(
        t: &Tensor<B>,
        visited: &mut HashSet<TensorId>,
        order: &mut Vec<Tensor<B>>,
    ) {
        if visited.contains(&t.id()) {
            return;
        }
        visited.insert(t.id());
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    visit(root, &mut visited, &mut order);
    order
}

/// Compute gradients of `root` with respect to every tensor in its graph.
///
/// `root` must be a scalar. This is the entry point behind
/// `tensor.backward()`.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(crate::Error::msg(
            "backward() requires a scalar tensor. \
             Reduce with .sum_all() or .mean_all() first.",
        ));
    }

    let topo = build_topo(root);

    let mut grads = GradStore::new();
    let ones = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    grads.grads.insert(root.id(), ones);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue, // no gradient flows to this tensor
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => {
                grads.accumulate(input.id(), grad_output)?;
            }

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                compute_unary_grad(*op, &grad_output, input, &mut grads)?;
            }

            Op::Reduce { input, op, dims } => {
                compute_reduce_grad(*op, &grad_output, input, dims, &mut grads)?;
            }

            Op::Matmul { lhs, rhs } => {
                // grad_A = g @ B^T, grad_B = A^T @ g
                let rhs_t = rhs.t()?.contiguous()?;
                let grad_lhs = grad_output.matmul(&rhs_t)?;
                grads.accumulate(lhs.id(), grad_lhs)?;

                let lhs_t = lhs.t()?.contiguous()?;
                let grad_rhs = lhs_t.matmul(&grad_output)?;
                grads.accumulate(rhs.id(), grad_rhs)?;
            }

            Op::Reshape { input, src_shape } => {
                let grad = grad_output.reshape(src_shape.clone())?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Transpose { input, dim0, dim1 } => {
                // Transpose is its own inverse.
                let grad = grad_output.transpose(*dim0, *dim1)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Narrow {
                input, dim, start, ..
            } => {
                compute_narrow_grad(&grad_output, input, *dim, *start, &mut grads)?;
            }

            Op::Affine { input, mul, .. } => {
                // d(x * mul + add)/dx = mul
                let grad = grad_output.affine(*mul, 0.0)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
            } => {
                compute_conv2d_grad(
                    &grad_output,
                    input,
                    weight,
                    bias.as_ref(),
                    *stride,
                    *padding,
                    &mut grads,
                )?;
            }

            Op::MaxPool2d { input, indices, .. } => {
                compute_maxpool2d_grad(&grad_output, input, indices, &mut grads)?;
            }

            Op::Cat { inputs, dim, sizes } => {
                // Slice the gradient back into one piece per input.
                let mut offset = 0usize;
                for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
                    let grad_slice = grad_output.narrow(*dim, offset, sz)?;
                    grads.accumulate(inp.id(), grad_slice)?;
                    offset += sz;
                }
            }
        }
    }

    Ok(grads)
}

// Binary gradients

fn compute_binary_grad<B: Backend>(
    op: BinaryOp,
    grad_output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        BinaryOp::Add => {
            let grad_lhs = reduce_broadcast_grad(grad_output, lhs.shape())?;
            let grad_rhs = reduce_broadcast_grad(grad_output, rhs.shape())?;
            grads.accumulate(lhs.id(), grad_lhs)?;
            grads.accumulate(rhs.id(), grad_rhs)?;
        }
        BinaryOp::Sub => {
            let grad_lhs = reduce_broadcast_grad(grad_output, lhs.shape())?;
            let neg = grad_output.neg()?;
            let grad_rhs = reduce_broadcast_grad(&neg, rhs.shape())?;
            grads.accumulate(lhs.id(), grad_lhs)?;
            grads.accumulate(rhs.id(), grad_rhs)?;
        }
        BinaryOp::Mul => {
            let raw_lhs = grad_output.mul(rhs)?;
            let raw_rhs = grad_output.mul(lhs)?;
            grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
        }
        BinaryOp::Div => {
            // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2
            let raw_lhs = grad_output.div(rhs)?;
            grads.accumulate(lhs.id(), reduce_broadcast_grad(&raw_lhs, lhs.shape())?)?;
            let neg_grad = grad_output.neg()?;
            let b_sq = rhs.mul(rhs)?;
            let raw_rhs = neg_grad.mul(lhs)?.div(&b_sq)?;
            grads.accumulate(rhs.id(), reduce_broadcast_grad(&raw_rhs, rhs.shape())?)?;
        }
    }
    Ok(())
}

/// Sum a gradient over the dimensions that broadcasting expanded so its
/// shape matches the original operand.
///
/// Example: lhs [1, 4] broadcast to [3, 4] means grad_lhs must sum the
/// [3, 4] gradient over dim 0 back down to [1, 4].
fn reduce_broadcast_grad<B: Backend>(
    grad: &Tensor<B>,
    target_shape: &Shape,
) -> Result<Tensor<B>> {
    let grad_shape = grad.dims();
    let target_dims = target_shape.dims();

    if grad_shape == target_dims {
        return Ok(grad.clone());
    }

    // Pad target dims with leading 1s to match grad rank.
    let grad_rank = grad_shape.len();
    let target_rank = target_dims.len();
    let mut padded_target = vec![1usize; grad_rank];
    let offset = grad_rank - target_rank;
    padded_target[offset..offset + target_rank].copy_from_slice(target_dims);

    let mut dims_to_sum: Vec<usize> = Vec::new();
    for d in 0..grad_rank {
        if padded_target[d] == 1 && grad_shape[d] > 1 {
            dims_to_sum.push(d);
        }
    }

    // Sum with keep_dim so indices stay stable, then reshape down.
    let mut result = grad.clone();
    for &d in dims_to_sum.iter().rev() {
        result = result.sum(d, true)?;
    }
    result.reshape(target_shape.clone())
}

// Unary gradients

fn compute_unary_grad<B: Backend>(
    op: UnaryOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let grad_input = match op {
        // d(-x)/dx = -1
        UnaryOp::Neg => grad_output.neg()?,

        // d(e^x)/dx = e^x
        UnaryOp::Exp => {
            let exp_x = input.exp()?;
            grad_output.mul(&exp_x)?
        }

        // d(ln x)/dx = 1/x
        UnaryOp::Log => grad_output.div(input)?,

        // d(x^2)/dx = 2x
        UnaryOp::Square => {
            let two_x = input.affine(2.0, 0.0)?;
            grad_output.mul(&two_x)?
        }

        // d(relu(x))/dx = 1 if x > 0 else 0
        UnaryOp::Relu => {
            let input_data = input.to_f64_vec()?;
            let mask_data: Vec<f64> = input_data
                .iter()
                .map(|&v| if v > 0.0 { 1.0 } else { 0.0 })
                .collect();
            let mask = Tensor::<B>::from_f64_slice(
                &mask_data,
                input.shape().clone(),
                input.dtype(),
                input.device(),
            )?;
            grad_output.mul(&mask)?
        }
    };

    grads.accumulate(input.id(), grad_input)?;
    Ok(())
}

// Reduction gradients

fn compute_reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        ReduceOp::Sum => {
            if dims.is_empty() {
                let grad_val = grad_output.to_scalar_f64()?;
                let grad = Tensor::<B>::full(
                    input.shape().clone(),
                    grad_val,
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            } else {
                let grad = expand_grad_for_reduce(grad_output, input, dims)?;
                grads.accumulate(input.id(), grad)?;
            }
        }
        ReduceOp::Mean => {
            if dims.is_empty() {
                let n = input.elem_count() as f64;
                let grad_val = grad_output.to_scalar_f64()? / n;
                let grad = Tensor::<B>::full(
                    input.shape().clone(),
                    grad_val,
                    input.dtype(),
                    input.device(),
                )?;
                grads.accumulate(input.id(), grad)?;
            } else {
                let n: f64 = dims.iter().map(|&d| input.dims()[d] as f64).product();
                let grad = expand_grad_for_reduce(grad_output, input, dims)?;
                let grad = grad.affine(1.0 / n, 0.0)?;
                grads.accumulate(input.id(), grad)?;
            }
        }
        ReduceOp::Max => {
            // Gradient flows to the element(s) that achieved the maximum,
            // split equally among ties.
            let input_data = input.to_f64_vec()?;
            let input_dims = input.dims().to_vec();
            let input_shape = input.shape().clone();
            let total = input_shape.elem_count();
            let input_strides = input_shape.stride_contiguous();

            let grad_expanded = expand_grad_for_reduce(grad_output, input, dims)?;
            let grad_exp_data = grad_expanded.to_f64_vec()?;

            let reduced_dims: Vec<usize> = input_dims
                .iter()
                .enumerate()
                .filter(|(i, _)| !dims.contains(i))
                .map(|(_, &d)| d)
                .collect();
            let reduced_shape = if reduced_dims.is_empty() {
                Shape::from(())
            } else {
                Shape::new(reduced_dims)
            };
            let reduced_total = reduced_shape.elem_count();
            let out_strides = reduced_shape.stride_contiguous();

            // Map each input position to its reduced slot.
            let slot_of = |flat_idx: usize| -> usize {
                let mut md = vec![0usize; input_dims.len()];
                let mut remainder = flat_idx;
                for i in 0..input_dims.len() {
                    if input_strides[i] > 0 {
                        md[i] = remainder / input_strides[i];
                        remainder %= input_strides[i];
                    }
                }
                let mut out_flat = 0;
                let mut j = 0;
                for (i, &v) in md.iter().enumerate() {
                    if !dims.contains(&i) {
                        if j < out_strides.len() {
                            out_flat += v * out_strides[j];
                        }
                        j += 1;
                    }
                }
                out_flat
            };

            let mut extrema = vec![f64::NEG_INFINITY; reduced_total];
            for flat_idx in 0..total {
                let slot = slot_of(flat_idx);
                if input_data[flat_idx] > extrema[slot] {
                    extrema[slot] = input_data[flat_idx];
                }
            }

            let mut counts = vec![0.0f64; reduced_total];
            for flat_idx in 0..total {
                let slot = slot_of(flat_idx);
                if input_data[flat_idx] == extrema[slot] {
                    counts[slot] += 1.0;
                }
            }

            let mut mask = vec![0.0f64; total];
            for flat_idx in 0..total {
                let slot = slot_of(flat_idx);
                if input_data[flat_idx] == extrema[slot] {
                    mask[flat_idx] = grad_exp_data[flat_idx] / counts[slot];
                }
            }

            let grad =
                Tensor::<B>::from_f64_slice(&mask, input_shape, input.dtype(), input.device())?;
            grads.accumulate(input.id(), grad)?;
        }
        ReduceOp::ArgMax => {
            // Integer indices: not differentiable, no gradient.
        }
    }
    Ok(())
}

/// Repeat a reduced gradient back out to the input shape.
///
/// After sum(dim=d) the gradient lost dimension d; this repeats its values
/// along the removed dimension(s).
fn expand_grad_for_reduce<B: Backend>(
    grad: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
) -> Result<Tensor<B>> {
    let input_dims = input.dims().to_vec();
    let input_shape = input.shape().clone();
    let grad_data = grad.to_f64_vec()?;
    let total = input_shape.elem_count();
    let input_strides = input_shape.stride_contiguous();

    let grad_dims: Vec<usize> = input_dims
        .iter()
        .enumerate()
        .filter(|(i, _)| !dims.contains(i))
        .map(|(_, &d)| d)
        .collect();
    let grad_shape = if grad_dims.is_empty() {
        Shape::from(())
    } else {
        Shape::new(grad_dims)
    };
    let grad_strides = grad_shape.stride_contiguous();

    let mut result_data = vec![0.0f64; total];

    for (flat_idx, slot) in result_data.iter_mut().enumerate() {
        let mut md = vec![0usize; input_dims.len()];
        let mut remainder = flat_idx;
        for i in 0..input_dims.len() {
            if input_strides[i] > 0 {
                md[i] = remainder / input_strides[i];
                remainder %= input_strides[i];
            }
        }

        let mut grad_flat = 0;
        let mut j = 0;
        for (i, &v) in md.iter().enumerate() {
            if !dims.contains(&i) {
                if j < grad_strides.len() {
                    grad_flat += v * grad_strides[j];
                }
                j += 1;
            }
        }

        if grad_flat < grad_data.len() {
            *slot = grad_data[grad_flat];
        }
    }

    Tensor::<B>::from_f64_slice(&result_data, input_shape, input.dtype(), input.device())
}

// Narrow gradient

/// Place the gradient of a slice into a zero tensor at its original
/// position.
fn compute_narrow_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    dim: usize,
    start: usize,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let input_shape = input.shape().clone();
    let grad_data = grad_output.to_f64_vec()?;
    let total = input_shape.elem_count();
    let input_strides = input_shape.stride_contiguous();

    let grad_out_dims = grad_output.dims();
    let grad_strides = Shape::new(grad_out_dims.to_vec()).stride_contiguous();
    let grad_total = grad_output.elem_count();

    let mut result_data = vec![0.0f64; total];

    for (grad_flat, &g) in grad_data.iter().enumerate().take(grad_total) {
        let mut md = vec![0usize; grad_out_dims.len()];
        let mut remainder = grad_flat;
        for i in 0..grad_out_dims.len() {
            if grad_strides[i] > 0 {
                md[i] = remainder / grad_strides[i];
                remainder %= grad_strides[i];
            }
        }

        md[dim] += start;

        let mut input_flat = 0;
        for i in 0..md.len() {
            input_flat += md[i] * input_strides[i];
        }

        if input_flat < total {
            result_data[input_flat] = g;
        }
    }

    let grad =
        Tensor::<B>::from_f64_slice(&result_data, input_shape, input.dtype(), input.device())?;
    grads.accumulate(input.id(), grad)?;
    Ok(())
}

// Conv2d gradient

/// Conv2d backward via the same im2col factorization as the forward pass:
///   grad_weight = sum_n grad_out[n] x columns[n]^T
///   grad_input  = col2im(weight^T x grad_out[n])
///   grad_bias   = sum over batch and spatial positions of grad_out
fn compute_conv2d_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    weight: &Tensor<B>,
    bias: Option<&Tensor<B>>,
    stride: [usize; 2],
    padding: [usize; 2],
    grads: &mut GradStore<B>,
) -> Result<()> {
    let in_dims = input.dims();
    let w_dims = weight.dims();
    let go_dims = grad_output.dims();
    let (n_batch, c_in, h, w) = (in_dims[0], in_dims[1], in_dims[2], in_dims[3]);
    let (c_out, _wc_in, kh, kw) = (w_dims[0], w_dims[1], w_dims[2], w_dims[3]);
    let h_out = go_dims[2];
    let w_out = go_dims[3];
    let [sh, sw] = stride;
    let [ph, pw] = padding;

    let input_data = input.contiguous()?.to_f64_vec()?;
    let weight_data = weight.contiguous()?.to_f64_vec()?;
    let grad_out_data = grad_output.contiguous()?.to_f64_vec()?;

    let col_rows = c_in * kh * kw;
    let col_cols = h_out * w_out;
    let sample_size = c_in * h * w;

    // grad_weight
    let mut grad_w = vec![0.0f64; c_out * col_rows];
    let mut columns = vec![0.0f64; col_rows * col_cols];

    for ni in 0..n_batch {
        let in_offset = ni * sample_size;
        crate::tensor::im2col(
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

        let go_offset = ni * c_out * col_cols;
        crate::tensor::gemm_a_bt(
            &grad_out_data[go_offset..go_offset + c_out * col_cols],
            &columns,
            &mut grad_w,
            c_out,
            col_rows,
            col_cols,
        );
    }

    let grad_weight_t = Tensor::<B>::from_f64_slice(
        &grad_w,
        weight.shape().clone(),
        weight.dtype(),
        weight.device(),
    )?;
    grads.accumulate(weight.id(), grad_weight_t)?;

    // grad_input
    let mut grad_in = vec![0.0f64; n_batch * sample_size];

    for ni in 0..n_batch {
        for v in columns.iter_mut() {
            *v = 0.0;
        }

        let go_offset = ni * c_out * col_cols;
        crate::tensor::gemm_at_b(
            &weight_data,
            &grad_out_data[go_offset..go_offset + c_out * col_cols],
            &mut columns,
            col_rows,
            col_cols,
            c_out,
        );

        let in_offset = ni * sample_size;
        crate::tensor::col2im(
            &columns,
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
            &mut grad_in[in_offset..in_offset + sample_size],
        );
    }

    let grad_input_t = Tensor::<B>::from_f64_slice(
        &grad_in,
        input.shape().clone(),
        input.dtype(),
        input.device(),
    )?;
    grads.accumulate(input.id(), grad_input_t)?;

    // grad_bias
    if let Some(b) = bias {
        let mut grad_b = vec![0.0f64; c_out];
        for ni in 0..n_batch {
            for co in 0..c_out {
                let go_offset = (ni * c_out + co) * col_cols;
                for j in 0..col_cols {
                    grad_b[co] += grad_out_data[go_offset + j];
                }
            }
        }
        let grad_bias_t =
            Tensor::<B>::from_f64_slice(&grad_b, b.shape().clone(), b.dtype(), b.device())?;
        grads.accumulate(b.id(), grad_bias_t)?;
    }

    Ok(())
}

// MaxPool2d gradient

/// Gradient flows only to the positions that achieved each window's max;
/// those positions were recorded during the forward pass.
fn compute_maxpool2d_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    indices: &[usize],
    grads: &mut GradStore<B>,
) -> Result<()> {
    let input_size = input.elem_count();
    let grad_out_data = grad_output.contiguous()?.to_f64_vec()?;

    let mut grad_in = vec![0.0f64; input_size];
    for (out_idx, &in_idx) in indices.iter().enumerate() {
        if in_idx < input_size && out_idx < grad_out_data.len() {
            grad_in[in_idx] += grad_out_data[out_idx];
        }
    }

    let grad_input_t = Tensor::<B>::from_f64_slice(
        &grad_in,
        input.shape().clone(),
        input.dtype(),
        input.device(),
    )?;
    grads.accumulate(input.id(), grad_input_t)?;
    Ok(())
}
