//! Frontend op graph -> backend IR.

use std::collections::HashMap;

use crate::ir::{BackendAttr, BackendAttrs, BackendGraph, DataFormat, TensorDesc};
use crate::op::{AttrValue, Attributes, Op, OpAttr, OpKind};
use crate::shape_infer::is_channel_last;
use crate::{bail, DataType, Error, Layout, LogicalTensor, OpGraph, Result};

/// Backend op name for a frontend kind, or `None` if the backend cannot compile it.
pub fn backend_op_name(kind: OpKind) -> Option<&'static str> {
    let name = match kind {
        OpKind::Add | OpKind::BiasAdd => "add",
        OpKind::Subtract => "sub",
        OpKind::Multiply => "mul",
        OpKind::Divide => "div",
        OpKind::MatMul => "matmul",
        OpKind::Quantize => "quantize",
        OpKind::Dequantize => "dequantize",
        OpKind::StaticReshape => "static_reshape",
        OpKind::StaticTranspose => "transpose",
        OpKind::SoftMax => "softmax",
        OpKind::Reorder => "reorder",
        OpKind::TypeCast => "cast",
        OpKind::Relu => "relu",
        OpKind::Sigmoid => "sigmoid",
        OpKind::Gelu => "gelu",
        OpKind::ReluBackprop => "relu_backprop",
        OpKind::SigmoidBackprop => "sigmoid_backprop",
        OpKind::GeluBackprop => "gelu_backprop",
        OpKind::ReduceSum => "reduce",
        OpKind::Convolution
        | OpKind::ConvTranspose
        | OpKind::MaxPool
        | OpKind::AvgPool
        | OpKind::BatchNormFolding
        | OpKind::MulScales => return None,
    };
    Some(name)
}

pub fn is_supported_kind(kind: OpKind) -> bool {
    backend_op_name(kind).is_some()
}

/// Map `axis` in `[-ndims, ndims)` into `[0, ndims)`.
pub fn normalize_axis(axis: i64, ndims: usize) -> i32 {
    let ndims = ndims as i64;
    debug_assert!(axis >= -ndims && axis < ndims, "axis {axis} out of range for rank {ndims}");
    (if axis < 0 { ndims + axis } else { axis }) as i32
}

/// Recover the dense blocking of a strided layout.
///
/// Returns the original dim indices ordered from the largest stride to the smallest, together
/// with the strides in that order. Equal strides keep their original relative order.
pub fn blocking_permutation(strides: &[i64]) -> (Vec<usize>, Vec<i64>) {
    let mut ordered = strides.to_vec();
    ordered.sort_unstable_by(|a, b| b.cmp(a));
    let mut visited = vec![false; strides.len()];
    let mut perm = Vec::with_capacity(strides.len());
    for s in &ordered {
        // every sorted stride has at least one unvisited source
        if let Some(j) = (0..strides.len()).find(|&j| !visited[j] && strides[j] == *s) {
            visited[j] = true;
            perm.push(j);
        }
    }
    (perm, ordered)
}

/// Element types map one to one; `undef` has no backend counterpart.
pub fn convert_data_type(dtype: DataType) -> Result<DataType> {
    match dtype {
        DataType::Undef => bail!("logical tensor with undefined data type reached translation"),
        other => Ok(other),
    }
}

pub fn convert_logical_tensor(lt: &LogicalTensor) -> Result<TensorDesc> {
    let dims = lt.vdims().to_vec();
    let dtype = convert_data_type(lt.data_type)?;
    let desc = match &lt.layout {
        Layout::Strided(strides) if strides.len() == dims.len() => {
            if let Some(s) = strides.iter().find(|s| **s < 0) {
                bail!("logical tensor {} has negative stride {s}", lt.id)
            }
            let (perm, ordered) = blocking_permutation(strides);
            TensorDesc {
                dims,
                dtype,
                format: DataFormat::Blocking(perm),
                strides: ordered,
            }
        }
        _ => TensorDesc {
            dims,
            dtype,
            format: DataFormat::Any,
            strides: Vec::new(),
        },
    };
    Ok(desc)
}

/// Generic attribute conversion: integers narrow to 32 bits, everything else passes through.
pub fn convert_attrs(attrs: &Attributes) -> BackendAttrs {
    attrs
        .iter()
        .map(|(name, value)| {
            let value = match value {
                AttrValue::Int(v) => BackendAttr::Int(*v as i32),
                AttrValue::Ints(v) => BackendAttr::Ints(v.iter().map(|x| *x as i32).collect()),
                AttrValue::Float(v) => BackendAttr::Float(*v),
                AttrValue::Floats(v) => BackendAttr::Floats(v.clone()),
                AttrValue::Str(v) => BackendAttr::Str(v.clone()),
                AttrValue::Bool(v) => BackendAttr::Bool(*v),
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

fn set(attrs: &mut BackendAttrs, name: &str, value: BackendAttr) {
    attrs.insert(name.to_string(), value);
}

/// Attributes of the backend op for `op`, whose first input has rank `input_dim`.
fn backend_attrs(op: &Op, graph: &OpGraph, input_dim: usize) -> Result<BackendAttrs> {
    let mut attrs = BackendAttrs::new();
    let output_dtype = || {
        let out = op.outputs().first().ok_or_else(|| {
            Error::InvalidGraph(format!("op {} ({}) has no outputs", op.id(), op.kind()))
        })?;
        Ok::<_, Error>(graph.value(*out).logical_tensor().data_type)
    };
    match op.kind() {
        OpKind::Quantize | OpKind::Dequantize => {
            if let Some(qtype) = op.string(OpAttr::Qtype)? {
                set(&mut attrs, "per_channel", BackendAttr::Bool(qtype == "per_channel"));
            }
            if let Some(axis) = op.int(OpAttr::Axis)? {
                set(
                    &mut attrs,
                    "channel_axis",
                    BackendAttr::Int(normalize_axis(axis, input_dim)),
                );
            }
            let scales = op.require_floats(OpAttr::Scales)?.to_vec();
            let zps = op.require_ints(OpAttr::Zps)?.iter().map(|z| *z as i32).collect();
            set(&mut attrs, "scales", BackendAttr::Floats(scales));
            set(&mut attrs, "zero_points", BackendAttr::Ints(zps));
            let dtype = convert_data_type(output_dtype()?)?;
            set(&mut attrs, "dtype", BackendAttr::DataType(dtype));
        }
        OpKind::SoftMax => {
            let axis = op.int(OpAttr::Axis)?.unwrap_or(1);
            set(
                &mut attrs,
                "axis",
                BackendAttr::Ints(vec![normalize_axis(axis, input_dim)]),
            );
        }
        OpKind::StaticReshape => {
            let shape = op.require_ints(OpAttr::Shape)?.to_vec();
            set(&mut attrs, "shape", BackendAttr::Longs(shape));
            let special_zero = op.require_boolean(OpAttr::SpecialZero)?;
            set(&mut attrs, "special_zero", BackendAttr::Bool(special_zero));
        }
        OpKind::StaticTranspose => {
            let order = op
                .require_ints(OpAttr::Order)?
                .iter()
                .map(|a| normalize_axis(*a, input_dim))
                .collect();
            set(&mut attrs, "order", BackendAttr::Ints(order));
        }
        OpKind::TypeCast => {
            let dtype = convert_data_type(output_dtype()?)?;
            set(&mut attrs, "dtype", BackendAttr::DataType(dtype));
        }
        OpKind::ReduceSum => {
            let axes = op
                .require_ints(OpAttr::Axes)?
                .iter()
                .map(|a| normalize_axis(*a, input_dim))
                .collect();
            set(&mut attrs, "rd_axis", BackendAttr::Ints(axes));
            set(&mut attrs, "rd_op", BackendAttr::Str("sum".to_string()));
            let keep_dims = op.boolean(OpAttr::KeepDims)?.unwrap_or(false);
            set(&mut attrs, "keep_dims", BackendAttr::Bool(keep_dims));
        }
        OpKind::BiasAdd => {
            let format = op.string(OpAttr::DataFormat)?.unwrap_or("NXC");
            let axis = if is_channel_last(format) {
                input_dim as i32 - 1
            } else {
                1
            };
            set(&mut attrs, "bc_axis", BackendAttr::Ints(vec![axis]));
        }
        _ => attrs = convert_attrs(op.attrs()),
    }
    Ok(attrs)
}

/// Result of translating one partition.
#[derive(Debug, Clone)]
pub struct Translation {
    pub graph: BackendGraph,
    /// Boundary input logical tensor id -> unique id of its backend input op.
    pub inputs: HashMap<usize, usize>,
    /// Boundary output logical tensor id -> unique id of its backend output op.
    pub outputs: HashMap<usize, usize>,
}

/// Reject any op the backend has no counterpart for.
pub fn check_supported(graph: &OpGraph) -> Result<()> {
    match graph.ops().iter().find(|op| !is_supported_kind(op.kind())) {
        Some(op) => Err(Error::UnsupportedOp { kind: op.kind() }),
        None => Ok(()),
    }
}

/// Rebuild `graph` as backend IR.
///
/// Boundary inputs become `input` ops (tagged local-constant when the caller marks them
/// constant); every value listed in `outputs` also feeds an `output` op. Inputs that resolve
/// to neither a translated producer nor a boundary input are left dangling for
/// [`BackendGraph::check_connection`] to report.
pub fn translate(
    graph: &OpGraph,
    inputs: &[LogicalTensor],
    outputs: &[LogicalTensor],
) -> Result<Translation> {
    check_supported(graph)?;

    let mut sub = BackendGraph::new();
    let mut next_id = 0;
    let mut inputs_map = HashMap::new();
    let mut outputs_map = HashMap::new();
    let mut input_tensors = HashMap::new();
    let mut op_mapping: HashMap<usize, usize> = HashMap::new();

    for in_lt in inputs {
        let mut attrs = BackendAttrs::new();
        if in_lt.is_constant() {
            set(&mut attrs, "constant", BackendAttr::Int(1));
        }
        let op = sub.make_input(convert_logical_tensor(in_lt)?, attrs, next_id);
        let t = sub.ops[op].outputs[0];
        sub.tensors[t].constant = in_lt.is_constant();
        inputs_map.insert(in_lt.id, next_id);
        input_tensors.insert(in_lt.id, t);
        next_id += 1;
    }

    for idx in graph.topo_order()? {
        let op = graph.op(idx);
        let name = match backend_op_name(op.kind()) {
            Some(name) => name,
            None => bail!("op {} ({}) slipped past the support check", op.id(), op.kind()),
        };

        let mut producer_ts = Vec::with_capacity(op.inputs().len());
        for v in op.inputs() {
            let value = graph.value(*v);
            let lt = value.logical_tensor();
            let translated = value
                .producer()
                .and_then(|(p, port)| op_mapping.get(&p).map(|b| sub.ops[*b].outputs[port]));
            let t = match translated.or_else(|| input_tensors.get(&lt.id).copied()) {
                Some(t) => t,
                None => sub.add_tensor(convert_logical_tensor(lt)?),
            };
            producer_ts.push(t);
        }

        let mut consumer_ts = Vec::with_capacity(op.outputs().len());
        for v in op.outputs() {
            let lt = graph.value(*v).logical_tensor();
            let desc = convert_logical_tensor(lt)?;
            let target = match &desc.format {
                DataFormat::Blocking(perm) => Some((perm.clone(), desc.strides.clone())),
                DataFormat::Any => None,
            };
            let t = sub.add_tensor(desc);
            consumer_ts.push(t);
            if outputs.iter().any(|o| o.id == lt.id) {
                let mut attrs = BackendAttrs::new();
                if let Some((perm, strides)) = target {
                    let perm = perm.into_iter().map(|d| d as i32).collect();
                    set(&mut attrs, "target_formats", BackendAttr::Ints(perm));
                    set(&mut attrs, "target_strides", BackendAttr::Longs(strides));
                }
                sub.make_output(t, attrs, next_id);
                outputs_map.insert(lt.id, next_id);
                next_id += 1;
            }
        }

        let input_dim = producer_ts
            .first()
            .map(|t| sub.tensors[*t].desc.dims.len())
            .unwrap_or(0);
        let attrs = backend_attrs(op, graph, input_dim)?;
        let b = sub.make(name, producer_ts, consumer_ts, attrs, next_id);
        next_id += 1;
        op_mapping.insert(idx, b);
    }

    log::debug!(
        "translated {} frontend ops into {} backend ops",
        graph.ops().len(),
        sub.ops.len()
    );
    Ok(Translation {
        graph: sub,
        inputs: inputs_map,
        outputs: outputs_map,
    })
}
