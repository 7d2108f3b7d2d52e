//! Reference f32 kernels over dense row-major buffers.

use gemm::{gemm, Parallelism};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefMutIterator, ParallelIterator};

use crate::shape_infer::broadcast_dims;
use crate::{bail, DataType, Result};

pub(crate) fn numel(dims: &[i64]) -> usize {
    dims.iter().map(|d| (*d).max(0) as usize).product()
}

fn row_major(dims: &[i64]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1].max(1) as usize;
    }
    strides
}

/// Offset into a tensor of `in_dims` broadcast to `out_dims`, for flat output index `idx`.
fn broadcast_offset(
    mut idx: usize,
    out_dims: &[i64],
    in_dims: &[i64],
    in_strides: &[usize],
) -> usize {
    let lead = out_dims.len() - in_dims.len();
    let mut offset = 0;
    for axis in (0..out_dims.len()).rev() {
        let extent = out_dims[axis] as usize;
        let coord = idx % extent.max(1);
        idx /= extent.max(1);
        if axis >= lead && in_dims[axis - lead] != 1 {
            offset += coord * in_strides[axis - lead];
        }
    }
    offset
}

pub fn map_unary(data: &mut [f32], f: impl Fn(f32) -> f32 + Sync + Send) {
    data.par_iter_mut().for_each(|x| *x = f(*x));
}

/// Elementwise `f(lhs, rhs)` with numpy broadcasting.
pub fn broadcast_binary(
    lhs: &[f32],
    lhs_dims: &[i64],
    rhs: &[f32],
    rhs_dims: &[i64],
    f: impl Fn(f32, f32) -> f32 + Sync + Send,
) -> Result<(Vec<f32>, Vec<i64>)> {
    let Some(out_dims) = broadcast_dims(lhs_dims, rhs_dims) else {
        bail!("cannot broadcast {lhs_dims:?} with {rhs_dims:?}")
    };
    let (ls, rs) = (row_major(lhs_dims), row_major(rhs_dims));
    let mut out = vec![0.0; numel(&out_dims)];
    out.par_iter_mut().enumerate().for_each(|(i, o)| {
        let l = lhs[broadcast_offset(i, &out_dims, lhs_dims, &ls)];
        let r = rhs[broadcast_offset(i, &out_dims, rhs_dims, &rs)];
        *o = f(l, r);
    });
    Ok((out, out_dims))
}

pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF: f32 = 0.044_715;

/// Tanh approximation.
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x)).tanh())
}

pub fn relu_backprop(src: f32, diff_dst: f32) -> f32 {
    if src > 0.0 {
        diff_dst
    } else {
        0.0
    }
}

/// `dst` is the forward result.
pub fn sigmoid_backprop(dst: f32, diff_dst: f32) -> f32 {
    diff_dst * dst * (1.0 - dst)
}

pub fn gelu_backprop(src: f32, diff_dst: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (src + GELU_COEF * src * src * src);
    let t = inner.tanh();
    let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEF * src * src);
    diff_dst * (0.5 * (1.0 + t) + 0.5 * src * (1.0 - t * t) * d_inner)
}

/// Batched matmul with optional transposition of the two innermost dims and numpy
/// broadcasting of batch dims. Rank-1 operands are promoted and the promoted dim dropped.
pub fn matmul(
    a: &[f32],
    a_dims: &[i64],
    b: &[f32],
    b_dims: &[i64],
    trans_a: bool,
    trans_b: bool,
) -> Result<(Vec<f32>, Vec<i64>)> {
    let (mut a_dims, mut b_dims) = (a_dims.to_vec(), b_dims.to_vec());
    let (a_vec, b_vec) = (a_dims.len() == 1, b_dims.len() == 1);
    if a_vec {
        a_dims.insert(0, 1);
    }
    if b_vec {
        b_dims.push(1);
    }
    let (ra, rb) = (a_dims.len(), b_dims.len());
    if ra < 2 || rb < 2 {
        bail!("matmul operands must have rank >= 1")
    }
    let trans_a = trans_a && !a_vec;
    let trans_b = trans_b && !b_vec;
    let (sa0, sa1) = (a_dims[ra - 2] as usize, a_dims[ra - 1] as usize);
    let (sb0, sb1) = (b_dims[rb - 2] as usize, b_dims[rb - 1] as usize);
    // (rows, cols, row stride, col stride) of each logical operand
    let (m, k, lhs_rs, lhs_cs) = if trans_a { (sa1, sa0, 1, sa1) } else { (sa0, sa1, sa1, 1) };
    let (k2, n, rhs_rs, rhs_cs) = if trans_b { (sb1, sb0, 1, sb1) } else { (sb0, sb1, sb1, 1) };
    if k != k2 {
        bail!("matmul inner dims differ: {k} vs {k2}")
    }

    let (a_batch, b_batch) = (&a_dims[..ra - 2], &b_dims[..rb - 2]);
    let Some(batch) = broadcast_dims(a_batch, b_batch) else {
        bail!("matmul batch dims {a_batch:?} and {b_batch:?} do not broadcast")
    };
    let (a_bs, b_bs) = (row_major(a_batch), row_major(b_batch));
    let batches = numel(&batch);
    let mut out = vec![0.0f32; batches * m * n];

    let num_threads = num_cpus::get();
    let parallelism = if num_threads > 1 {
        Parallelism::Rayon(num_threads)
    } else {
        Parallelism::None
    };

    for bi in 0..batches {
        let a_off = broadcast_offset(bi, &batch, a_batch, &a_bs) * sa0 * sa1;
        let b_off = broadcast_offset(bi, &batch, b_batch, &b_bs) * sb0 * sb1;
        let lhs_p = &a[a_off..a_off + sa0 * sa1];
        let rhs_p = &b[b_off..b_off + sb0 * sb1];
        let out_p = &mut out[bi * m * n..(bi + 1) * m * n];

        unsafe {
            gemm(
                /* m: usize = */ m,
                /* n: usize = */ n,
                /* k: usize = */ k,
                /* dst: *mut T = */ out_p.as_mut_ptr(),
                /* dst_cs: isize = */ 1,
                /* dst_rs: isize = */ n as isize,
                /* read_dst: bool = */ false,
                /* lhs: *const T = */ lhs_p.as_ptr(),
                /* lhs_cs: isize = */ lhs_cs as isize,
                /* lhs_rs: isize = */ lhs_rs as isize,
                /* rhs: *const T = */ rhs_p.as_ptr(),
                /* rhs_cs: isize = */ rhs_cs as isize,
                /* rhs_rs: isize = */ rhs_rs as isize,
                /* alpha: T = */ 0.0,
                /* beta: T = */ 1.0,
                /* conj_dst: bool = */ false,
                /* conj_lhs: bool = */ false,
                /* conj_rhs: bool = */ false,
                parallelism,
            )
        }
    }

    let mut dims = batch;
    if !a_vec {
        dims.push(m as i64);
    }
    if !b_vec {
        dims.push(n as i64);
    }
    Ok((out, dims))
}

/// Split `dims` around `axis` into (outer, extent, inner) element counts.
fn around(dims: &[i64], axis: usize) -> (usize, usize, usize) {
    (
        numel(&dims[..axis]),
        dims[axis] as usize,
        numel(&dims[axis + 1..]),
    )
}

pub fn softmax(data: &mut [f32], dims: &[i64], axis: usize) {
    let (outer, extent, inner) = around(dims, axis);
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| o * extent * inner + j * inner + i;
            let max = (0..extent).map(|j| data[at(j)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for j in 0..extent {
                let e = (data[at(j)] - max).exp();
                data[at(j)] = e;
                sum += e;
            }
            for j in 0..extent {
                data[at(j)] /= sum;
            }
        }
    }
}

/// Sum over `axes`. Returns the data and the dims with reduced axes kept as 1 or dropped.
pub fn reduce_sum(
    data: &[f32],
    dims: &[i64],
    axes: &[usize],
    keep_dims: bool,
) -> (Vec<f32>, Vec<i64>) {
    let kept: Vec<i64> = dims
        .iter()
        .enumerate()
        .map(|(i, d)| if axes.contains(&i) { 1 } else { *d })
        .collect();
    let strides = row_major(&kept);
    let mut out = vec![0.0; numel(&kept)];
    for (idx, x) in data.iter().enumerate() {
        let mut rest = idx;
        let mut offset = 0;
        for axis in (0..dims.len()).rev() {
            let extent = dims[axis].max(1) as usize;
            let coord = rest % extent;
            rest /= extent;
            if !axes.contains(&axis) {
                offset += coord * strides[axis];
            }
        }
        out[offset] += x;
    }
    let out_dims = if keep_dims {
        kept
    } else {
        dims.iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, d)| *d)
            .collect()
    };
    (out, out_dims)
}

/// Permute axes: output axis `i` is input axis `order[i]`.
pub fn transpose(data: &[f32], dims: &[i64], order: &[usize]) -> (Vec<f32>, Vec<i64>) {
    let src_strides = row_major(dims);
    let out_dims: Vec<i64> = order.iter().map(|a| dims[*a]).collect();
    let mut out = vec![0.0; data.len()];
    out.par_iter_mut().enumerate().for_each(|(idx, o)| {
        let mut rest = idx;
        let mut offset = 0;
        for axis in (0..out_dims.len()).rev() {
            let extent = out_dims[axis].max(1) as usize;
            offset += (rest % extent) * src_strides[order[axis]];
            rest /= extent;
        }
        *o = data[offset];
    });
    (out, out_dims)
}

/// Round-trip `x` through `dtype`: integers round and saturate, half types lose precision.
pub fn cast(x: f32, dtype: DataType) -> f32 {
    let mut bytes = [0u8; 4];
    dtype.write(&mut bytes, 0, x);
    dtype.read(&bytes, 0)
}

/// Per-element `(scale, zero point)` lookup for per-tensor or per-channel quantization.
pub struct QuantParams<'a> {
    pub scales: &'a [f32],
    pub zero_points: &'a [i32],
    /// `(extent, inner)` of the channel axis when quantizing per channel.
    pub channel: Option<(usize, usize)>,
}

impl QuantParams<'_> {
    fn at(&self, idx: usize) -> (f32, f32) {
        let c = match self.channel {
            Some((extent, inner)) => (idx / inner.max(1)) % extent.max(1),
            None => 0,
        };
        let scale = self.scales.get(c).or(self.scales.first()).copied().unwrap_or(1.0);
        let zp = self
            .zero_points
            .get(c)
            .or(self.zero_points.first())
            .copied()
            .unwrap_or(0);
        (scale, zp as f32)
    }
}

pub fn quantize(data: &mut [f32], params: &QuantParams<'_>, dtype: DataType) {
    data.par_iter_mut().enumerate().for_each(|(i, x)| {
        let (scale, zp) = params.at(i);
        *x = cast(*x / scale + zp, dtype);
    });
}

pub fn dequantize(data: &mut [f32], params: &QuantParams<'_>) {
    data.par_iter_mut().enumerate().for_each(|(i, x)| {
        let (scale, zp) = params.at(i);
        *x = (*x - zp) * scale;
    });
}

/// `(extent, inner)` of `axis` in `dims`.
pub fn channel_of(dims: &[i64], axis: usize) -> (usize, usize) {
    let (_, extent, inner) = around(dims, axis);
    (extent, inner)
}
