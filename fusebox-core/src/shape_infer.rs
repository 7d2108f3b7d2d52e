//! Per-kind shape inference and the partition-wide inference pass.
//!
//! Every [`OpKind`] has an inference function; the mapping is an exhaustive match, so a kind
//! without one does not compile.

use crate::op::{Op, OpAttr, OpKind};
use crate::{DataType, Error, Layout, LogicalTensor, OpGraph, Result};

/// `(scratch op, inputs, outputs) -> status`. Outputs are filled in place.
pub type ShapeInferFn = fn(&Op, &[LogicalTensor], &mut [LogicalTensor]) -> Result<()>;

impl OpKind {
    pub fn shape_infer_fn(&self) -> ShapeInferFn {
        match self {
            Self::Add | Self::Subtract | Self::Multiply | Self::Divide => infer_broadcast,
            Self::MatMul => infer_matmul,
            Self::Quantize => infer_quantize,
            Self::Dequantize => infer_dequantize,
            Self::StaticReshape => infer_reshape,
            Self::StaticTranspose => infer_transpose,
            Self::SoftMax => infer_softmax,
            Self::Reorder | Self::TypeCast | Self::MulScales => infer_identity,
            Self::Relu | Self::Sigmoid | Self::Gelu => infer_identity,
            Self::ReluBackprop | Self::SigmoidBackprop | Self::GeluBackprop => infer_backprop,
            Self::ReduceSum => infer_reduce,
            Self::BiasAdd => infer_bias_add,
            Self::Convolution => infer_conv,
            Self::ConvTranspose => infer_conv_transpose,
            Self::MaxPool | Self::AvgPool => infer_pool,
            Self::BatchNormFolding => infer_bn_folding,
        }
    }
}

/// Infer every op's outputs in topological order.
///
/// Values whose logical tensor id matches one of `inputs` see the caller's tensor instead of
/// their own. Inferred outputs are written back onto the graph with a concrete layout, and copied
/// into any entry of `outputs` with the same id. The first failing op aborts the pass.
pub fn infer_graph(
    graph: &mut OpGraph,
    inputs: &[LogicalTensor],
    outputs: &mut [LogicalTensor],
) -> Result<()> {
    for idx in graph.topo_order()? {
        let op = graph.op(idx);
        let scratch = op.scratch();
        let resolve = |lt: &LogicalTensor| {
            inputs
                .iter()
                .find(|t| t.id == lt.id)
                .unwrap_or(lt)
                .clone()
        };
        let ins: Vec<LogicalTensor> = op
            .inputs()
            .iter()
            .map(|v| resolve(graph.value(*v).logical_tensor()))
            .collect();
        let mut outs: Vec<LogicalTensor> = op
            .outputs()
            .iter()
            .map(|v| graph.value(*v).logical_tensor().clone())
            .collect();
        let out_values = op.outputs().to_vec();

        (op.kind().shape_infer_fn())(&scratch, &ins, &mut outs)?;

        for (v, mut lt) in out_values.into_iter().zip(outs) {
            lt.force_dense_layout();
            if let Some(slot) = outputs.iter_mut().find(|t| t.id == lt.id) {
                *slot = lt.clone();
            }
            graph.value_mut(v).lt = lt;
        }
    }
    Ok(())
}

fn fail(op: &Op, reason: impl Into<String>) -> Error {
    Error::ShapeInference {
        op_id: op.id(),
        kind: op.kind(),
        reason: reason.into(),
    }
}

fn expect_arity(
    op: &Op,
    inputs: &[LogicalTensor],
    outputs: &[LogicalTensor],
    n_in: usize,
) -> Result<()> {
    if inputs.len() < n_in {
        return Err(fail(
            op,
            format!("expected at least {n_in} inputs, got {}", inputs.len()),
        ));
    }
    if outputs.len() < op.kind().num_real_outputs() {
        return Err(fail(
            op,
            format!(
                "expected {} outputs, got {}",
                op.kind().num_real_outputs(),
                outputs.len()
            ),
        ));
    }
    Ok(())
}

fn known<'a>(op: &Op, lt: &'a LogicalTensor) -> Result<&'a [i64]> {
    if !lt.is_shape_known() {
        return Err(fail(op, format!("input {} has an unknown shape", lt.id)));
    }
    Ok(lt.vdims())
}

fn attr<T>(op: &Op, v: Result<T>) -> Result<T> {
    v.map_err(|e| fail(op, e.to_string()))
}

/// Write inferred `dims` into `out`, checking them against any dims it already declares.
fn set_output(op: &Op, out: &mut LogicalTensor, dims: Vec<i64>, fallback: DataType) -> Result<()> {
    if let Some(declared) = &out.dims {
        let conflict = declared.len() != dims.len()
            || declared
                .iter()
                .zip(&dims)
                .any(|(d, i)| *d >= 0 && d != i);
        if conflict {
            return Err(fail(
                op,
                format!("output {} declares {declared:?}, inferred {dims:?}", out.id),
            ));
        }
    }
    if matches!(&out.layout, Layout::Strided(s) if s.len() != dims.len()) {
        out.layout = Layout::Any;
    }
    out.dims = Some(dims);
    if out.data_type == DataType::Undef {
        out.data_type = fallback;
    }
    Ok(())
}

fn checked_product(dims: &[i64]) -> Option<i64> {
    dims.iter().try_fold(1i64, |acc, d| acc.checked_mul(*d))
}

/// `axis` in `[-rank, rank)` mapped into `[0, rank)`.
fn axis_in(op: &Op, axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    if axis < -rank || axis >= rank {
        return Err(fail(op, format!("axis {axis} out of range for rank {rank}")));
    }
    let axis = if axis < 0 { axis + rank } else { axis };
    Ok(axis as usize)
}

fn infer_identity(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let dims = known(op, &inputs[0])?.to_vec();
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

fn infer_backprop(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 2)?;
    let src = known(op, &inputs[0])?;
    let diff_dst = known(op, &inputs[1])?;
    if src != diff_dst {
        return Err(fail(op, format!("{src:?} and diff_dst {diff_dst:?} differ")));
    }
    set_output(op, &mut outputs[0], src.to_vec(), inputs[1].data_type)
}

/// The channel axis of a quantize pair must name a dim of its input.
fn check_channel_axis(op: &Op, rank: usize) -> Result<()> {
    if let Some(axis) = attr(op, op.int(OpAttr::Axis))? {
        axis_in(op, axis, rank)?;
    }
    Ok(())
}

fn infer_quantize(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let dims = known(op, &inputs[0])?.to_vec();
    check_channel_axis(op, dims.len())?;
    set_output(op, &mut outputs[0], dims, DataType::U8)
}

fn infer_dequantize(
    op: &Op,
    inputs: &[LogicalTensor],
    outputs: &mut [LogicalTensor],
) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let dims = known(op, &inputs[0])?.to_vec();
    check_channel_axis(op, dims.len())?;
    set_output(op, &mut outputs[0], dims, DataType::F32)
}

fn infer_softmax(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let dims = known(op, &inputs[0])?.to_vec();
    let axis = attr(op, op.int(OpAttr::Axis))?.unwrap_or(1);
    axis_in(op, axis, dims.len())?;
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

/// Numpy-style broadcast of two shapes.
pub(crate) fn broadcast_dims(lhs: &[i64], rhs: &[i64]) -> Option<Vec<i64>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let l = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let r = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        out[i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return None,
        };
    }
    Some(out)
}

fn infer_broadcast(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 2)?;
    let lhs = known(op, &inputs[0])?;
    let rhs = known(op, &inputs[1])?;
    let dims = broadcast_dims(lhs, rhs)
        .ok_or_else(|| fail(op, format!("cannot broadcast {lhs:?} with {rhs:?}")))?;
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

fn infer_matmul(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 2)?;
    let mut a = known(op, &inputs[0])?.to_vec();
    let mut b = known(op, &inputs[1])?.to_vec();
    if a.is_empty() || b.is_empty() {
        return Err(fail(op, "matmul operands must have rank >= 1"));
    }
    let (a_vec, b_vec) = (a.len() == 1, b.len() == 1);
    if a_vec {
        a.insert(0, 1);
    }
    if b_vec {
        b.push(1);
    }
    let trans_a = attr(op, op.boolean(OpAttr::TransposeA))?.unwrap_or(false);
    let trans_b = attr(op, op.boolean(OpAttr::TransposeB))?.unwrap_or(false);
    let (ra, rb) = (a.len(), b.len());
    if trans_a && !a_vec {
        a.swap(ra - 1, ra - 2);
    }
    if trans_b && !b_vec {
        b.swap(rb - 1, rb - 2);
    }
    let (m, k) = (a[ra - 2], a[ra - 1]);
    let (k2, n) = (b[rb - 2], b[rb - 1]);
    if k != k2 {
        return Err(fail(op, format!("inner dims differ: {k} vs {k2}")));
    }
    let mut dims = broadcast_dims(&a[..ra - 2], &b[..rb - 2])
        .ok_or_else(|| fail(op, "batch dims do not broadcast"))?;
    if !a_vec {
        dims.push(m);
    }
    if !b_vec {
        dims.push(n);
    }
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

fn infer_reshape(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let src = known(op, &inputs[0])?;
    let shape = attr(op, op.require_ints(OpAttr::Shape))?;
    let special_zero = attr(op, op.require_boolean(OpAttr::SpecialZero))?;

    let mut dims = Vec::with_capacity(shape.len());
    let mut infer_at = None;
    for (i, &d) in shape.iter().enumerate() {
        match d {
            0 if special_zero => {
                let copied = *src
                    .get(i)
                    .ok_or_else(|| fail(op, format!("special zero at {i} exceeds input rank")))?;
                dims.push(copied);
            }
            -1 if infer_at.is_none() => {
                infer_at = Some(i);
                dims.push(1);
            }
            -1 => return Err(fail(op, "more than one -1 in target shape")),
            d if d < 0 => return Err(fail(op, format!("invalid target dim {d}"))),
            d => dims.push(d),
        }
    }
    let overflow = || fail(op, format!("element count of {src:?} -> {shape:?} overflows"));
    let total = checked_product(src).ok_or_else(overflow)?;
    let partial = checked_product(&dims).ok_or_else(overflow)?;
    if let Some(i) = infer_at {
        if partial == 0 || total % partial != 0 {
            return Err(fail(op, format!("cannot infer -1 for {src:?} -> {shape:?}")));
        }
        dims[i] = total / partial;
    } else if partial != total {
        return Err(fail(op, format!("element count differs: {src:?} -> {shape:?}")));
    }
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

fn infer_transpose(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let src = known(op, &inputs[0])?;
    let order = attr(op, op.require_ints(OpAttr::Order))?;
    if order.len() != src.len() {
        return Err(fail(op, format!("order {order:?} does not match rank {}", src.len())));
    }
    let mut seen = vec![false; src.len()];
    let mut dims = Vec::with_capacity(src.len());
    for &axis in order {
        let axis = axis_in(op, axis, src.len())?;
        if std::mem::replace(&mut seen[axis], true) {
            return Err(fail(op, format!("order {order:?} is not a permutation")));
        }
        dims.push(src[axis]);
    }
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

fn infer_reduce(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let src = known(op, &inputs[0])?;
    let axes = attr(op, op.require_ints(OpAttr::Axes))?;
    if axes.is_empty() {
        return Err(fail(op, "empty reduction axes"));
    }
    let keep_dims = attr(op, op.boolean(OpAttr::KeepDims))?.unwrap_or(false);
    let mut reduced = vec![false; src.len()];
    for &axis in axes {
        reduced[axis_in(op, axis, src.len())?] = true;
    }
    let dims = src
        .iter()
        .zip(&reduced)
        .filter_map(|(d, r)| match (r, keep_dims) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(*d),
        })
        .collect();
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

pub(crate) fn is_channel_last(data_format: &str) -> bool {
    data_format == "NXC"
}

fn infer_bias_add(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 2)?;
    let src = known(op, &inputs[0])?;
    let bias = known(op, &inputs[1])?;
    let format = attr(op, op.string(OpAttr::DataFormat))?.unwrap_or("NXC");
    if src.len() < 2 {
        return Err(fail(op, "bias add needs a rank >= 2 input"));
    }
    let channels = if is_channel_last(format) { src[src.len() - 1] } else { src[1] };
    if bias != [channels] {
        return Err(fail(op, format!("bias {bias:?} does not match {channels} channels")));
    }
    set_output(op, &mut outputs[0], src.to_vec(), inputs[0].data_type)
}

/// Spatial parameters shared by convolution and pooling.
struct Window {
    strides: Vec<i64>,
    pads_begin: Vec<i64>,
    pads_end: Vec<i64>,
    dilations: Vec<i64>,
    auto_pad: String,
}

impl Window {
    fn from_op(op: &Op, spatial: usize) -> Result<Self> {
        let list = |a: OpAttr, default: i64| -> Result<Vec<i64>> {
            let v = attr(op, op.ints(a))?
                .map(<[i64]>::to_vec)
                .unwrap_or_else(|| vec![default; spatial]);
            if v.len() != spatial {
                return Err(fail(op, format!("`{}` must have {spatial} entries", a.as_str())));
            }
            Ok(v)
        };
        Ok(Self {
            strides: list(OpAttr::Strides, 1)?,
            pads_begin: list(OpAttr::PadsBegin, 0)?,
            pads_end: list(OpAttr::PadsEnd, 0)?,
            dilations: list(OpAttr::Dilations, 1)?,
            auto_pad: attr(op, op.string(OpAttr::AutoPad))?
                .unwrap_or("None")
                .to_string(),
        })
    }

    /// Output extent of spatial dim `i` for input extent `x` and kernel extent `k`.
    fn forward(&self, op: &Op, i: usize, x: i64, k: i64, ceil: bool) -> Result<i64> {
        let s = self.strides[i];
        if s <= 0 {
            return Err(fail(op, "strides must be positive"));
        }
        let out = match self.auto_pad.as_str() {
            "SAME_UPPER" | "SAME_LOWER" => (x + s - 1) / s,
            "VALID" => (x - self.dilations[i] * (k - 1) - 1) / s + 1,
            _ => {
                let span = x + self.pads_begin[i] + self.pads_end[i]
                    - self.dilations[i] * (k - 1)
                    - 1;
                if ceil {
                    (span + s - 1) / s + 1
                } else {
                    span / s + 1
                }
            }
        };
        if out <= 0 {
            return Err(fail(op, format!("spatial dim {i} collapses to {out}")));
        }
        Ok(out)
    }
}

/// Split `dims` into (batch, channels, spatial) for `data_format`.
fn split_activation(op: &Op, dims: &[i64], channel_last: bool) -> Result<(i64, i64, Vec<i64>)> {
    if dims.len() < 3 {
        return Err(fail(op, format!("expected rank >= 3, got {dims:?}")));
    }
    Ok(if channel_last {
        (dims[0], dims[dims.len() - 1], dims[1..dims.len() - 1].to_vec())
    } else {
        (dims[0], dims[1], dims[2..].to_vec())
    })
}

fn join_activation(n: i64, c: i64, spatial: Vec<i64>, channel_last: bool) -> Vec<i64> {
    let mut dims = vec![n];
    if channel_last {
        dims.extend(spatial);
        dims.push(c);
    } else {
        dims.push(c);
        dims.extend(spatial);
    }
    dims
}

/// Split weights into (O, I, spatial) for `weights_format` ("OIX" or "XIO").
fn split_weights(op: &Op, dims: &[i64]) -> Result<(i64, i64, Vec<i64>)> {
    let format = attr(op, op.string(OpAttr::WeightsFormat))?.unwrap_or("XIO");
    if dims.len() < 3 {
        return Err(fail(op, format!("weights rank must be >= 3, got {dims:?}")));
    }
    let r = dims.len();
    Ok(if format == "OIX" {
        (dims[0], dims[1], dims[2..].to_vec())
    } else {
        (dims[r - 1], dims[r - 2], dims[..r - 2].to_vec())
    })
}

fn infer_conv(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 2)?;
    let channel_last = is_channel_last(attr(op, op.string(OpAttr::DataFormat))?.unwrap_or("NXC"));
    let (n, ic, spatial) = split_activation(op, known(op, &inputs[0])?, channel_last)?;
    let (oc, wi, kernel) = split_weights(op, known(op, &inputs[1])?)?;
    let groups = attr(op, op.int(OpAttr::Groups))?.unwrap_or(1);
    if kernel.len() != spatial.len() || wi * groups != ic {
        return Err(fail(
            op,
            format!("weights ({oc}, {wi}, {kernel:?}) do not fit {ic} channels in {groups} groups"),
        ));
    }
    let window = Window::from_op(op, spatial.len())?;
    let out_spatial = spatial
        .iter()
        .zip(&kernel)
        .enumerate()
        .map(|(i, (x, k))| window.forward(op, i, *x, *k, false))
        .collect::<Result<Vec<_>>>()?;
    let dims = join_activation(n, oc, out_spatial, channel_last);
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

fn infer_conv_transpose(
    op: &Op,
    inputs: &[LogicalTensor],
    outputs: &mut [LogicalTensor],
) -> Result<()> {
    expect_arity(op, inputs, outputs, 2)?;
    let channel_last = is_channel_last(attr(op, op.string(OpAttr::DataFormat))?.unwrap_or("NXC"));
    let (n, ic, spatial) = split_activation(op, known(op, &inputs[0])?, channel_last)?;
    let (wo, wi, kernel) = split_weights(op, known(op, &inputs[1])?)?;
    let groups = attr(op, op.int(OpAttr::Groups))?.unwrap_or(1);
    if kernel.len() != spatial.len() || wi * groups != ic {
        return Err(fail(op, "weights do not fit the input"));
    }
    let window = Window::from_op(op, spatial.len())?;
    let output_padding = attr(op, op.ints(OpAttr::OutputPadding))?
        .map(<[i64]>::to_vec)
        .unwrap_or_else(|| vec![0; spatial.len()]);
    let mut out_spatial = Vec::with_capacity(spatial.len());
    for (i, (x, k)) in spatial.iter().zip(&kernel).enumerate() {
        let out = window.strides[i] * (x - 1) + window.dilations[i] * (k - 1) + 1
            - window.pads_begin[i]
            - window.pads_end[i]
            + output_padding.get(i).copied().unwrap_or(0);
        if out <= 0 {
            return Err(fail(op, format!("spatial dim {i} collapses to {out}")));
        }
        out_spatial.push(out);
    }
    let dims = join_activation(n, wo * groups, out_spatial, channel_last);
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

fn infer_pool(op: &Op, inputs: &[LogicalTensor], outputs: &mut [LogicalTensor]) -> Result<()> {
    expect_arity(op, inputs, outputs, 1)?;
    let channel_last = is_channel_last(attr(op, op.string(OpAttr::DataFormat))?.unwrap_or("NXC"));
    let (n, c, spatial) = split_activation(op, known(op, &inputs[0])?, channel_last)?;
    let kernel = attr(op, op.require_ints(OpAttr::Kernel))?;
    if kernel.len() != spatial.len() {
        return Err(fail(op, format!("kernel {kernel:?} does not match input rank")));
    }
    let window = Window::from_op(op, spatial.len())?;
    let ceil = attr(op, op.string(OpAttr::RoundingType))? == Some("ceil");
    let out_spatial = spatial
        .iter()
        .zip(kernel)
        .enumerate()
        .map(|(i, (x, k))| window.forward(op, i, *x, *k, ceil))
        .collect::<Result<Vec<_>>>()?;
    let dims = join_activation(n, c, out_spatial, channel_last);
    set_output(op, &mut outputs[0], dims, inputs[0].data_type)
}

/// Inputs: weights, [bias], gamma, beta, mean, variance. Outputs: folded weights, folded bias.
fn infer_bn_folding(
    op: &Op,
    inputs: &[LogicalTensor],
    outputs: &mut [LogicalTensor],
) -> Result<()> {
    expect_arity(op, inputs, outputs, 5)?;
    let weights = known(op, &inputs[0])?.to_vec();
    let gamma = known(op, &inputs[inputs.len() - 4])?.to_vec();
    if gamma.len() != 1 {
        return Err(fail(op, format!("gamma must be 1-D, got {gamma:?}")));
    }
    let dtype = inputs[0].data_type;
    let (weights_out, bias_out) = outputs.split_at_mut(1);
    set_output(op, &mut weights_out[0], weights, dtype)?;
    set_output(op, &mut bias_out[0], gamma, dtype)
}
