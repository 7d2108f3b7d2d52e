use fusebox_core::constant_prop::constant_propagation;
use fusebox_core::{
    DataType, EngineKind, Error, Layout, LogicalTensor, Op, OpAttr, OpGraph, OpKind, Partition,
    Status,
};

fn conv_pool_partition() -> Partition {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [1, 3, 16, 16], DataType::F32));
    let w = g.add_value(LogicalTensor::new(1, [8, 3, 3, 3], DataType::F32));
    let c = g.add_value(LogicalTensor::unknown(2, DataType::F32).with_any_layout());
    let pooled = g.add_value(LogicalTensor::unknown(3, DataType::F32));
    g.add_op(
        Op::new(OpKind::Convolution)
            .with_attr(OpAttr::Strides, vec![2i64, 2])
            .with_attr(OpAttr::PadsBegin, vec![1i64, 1])
            .with_attr(OpAttr::PadsEnd, vec![1i64, 1])
            .with_attr(OpAttr::DataFormat, "NCX")
            .with_attr(OpAttr::WeightsFormat, "OIX"),
        &[x, w],
        &[c],
    )
    .unwrap();
    g.add_op(
        Op::new(OpKind::MaxPool)
            .with_attr(OpAttr::Kernel, vec![2i64, 2])
            .with_attr(OpAttr::Strides, vec![2i64, 2])
            .with_attr(OpAttr::DataFormat, "NCX"),
        &[c],
        &[pooled],
    )
    .unwrap();
    Partition::from_graph(EngineKind::Cpu, g)
}

#[test]
fn inference_fills_outputs_with_dense_layout() {
    let p = conv_pool_partition();
    let mut outs = p.outputs().to_vec();
    p.infer_shape(p.inputs(), &mut outs).unwrap();
    assert_eq!(outs[0].vdims(), &[1, 8, 4, 4]);
    assert_eq!(outs[0].layout, Layout::Strided(vec![128, 16, 4, 1]));

    // the intermediate edge got a concrete layout too
    let working = p.working_graph().unwrap();
    let conv_out = working.values()[2].logical_tensor();
    assert_eq!(conv_out.vdims(), &[1, 8, 8, 8]);
    assert!(conv_out.strides().is_some());
}

#[test]
fn inference_is_idempotent() {
    let p = conv_pool_partition();
    let mut first = p.outputs().to_vec();
    p.infer_shape(p.inputs(), &mut first).unwrap();
    let graph_after_first = p.working_graph();

    let mut second = first.clone();
    p.infer_shape(p.inputs(), &mut second).unwrap();
    assert_eq!(first, second);
    assert_eq!(graph_after_first, p.working_graph());
}

#[test]
fn caller_inputs_override_graph_tensors() {
    let p = conv_pool_partition();
    let mut inputs = p.inputs().to_vec();
    inputs[0] = LogicalTensor::new(0, [2, 3, 32, 32], DataType::F32);
    let mut outs = p.outputs().to_vec();
    p.infer_shape(&inputs, &mut outs).unwrap();
    assert_eq!(outs[0].vdims(), &[2, 8, 8, 8]);
}

#[test]
fn first_failure_aborts() {
    let p = conv_pool_partition();
    let mut inputs = p.inputs().to_vec();
    // weights expect 3 input channels
    inputs[0] = LogicalTensor::new(0, [1, 4, 16, 16], DataType::F32);
    let mut outs = p.outputs().to_vec();
    let err = p.infer_shape(&inputs, &mut outs).unwrap_err();
    assert!(matches!(
        err,
        Error::ShapeInference {
            op_id: 0,
            kind: OpKind::Convolution,
            ..
        }
    ));
    assert_eq!(err.status(), Status::InvalidShape);
    assert!(!outs[0].is_shape_known());
}

#[test]
fn every_kind_has_an_inference_function() {
    for kind in OpKind::ALL {
        // resolving must not panic
        let _ = kind.shape_infer_fn();
    }
}

#[test]
fn constant_weights_fold_through_inferred_graph() {
    let mut g = OpGraph::empty();
    let w = g.add_value(LogicalTensor::new(0, [4, 4], DataType::F32).constant());
    let t = g.add_value(LogicalTensor::unknown(1, DataType::F32));
    let x = g.add_value(LogicalTensor::new(2, [2, 4], DataType::F32));
    let y = g.add_value(LogicalTensor::unknown(3, DataType::F32));
    g.add_op(
        Op::new(OpKind::StaticTranspose).with_attr(OpAttr::Order, vec![1i64, 0]),
        &[w],
        &[t],
    )
    .unwrap();
    g.add_op(Op::new(OpKind::MatMul), &[x, t], &[y]).unwrap();

    constant_propagation(&mut g).unwrap();
    assert!(g.op(0).is_constant());
    assert!(g.value(t).logical_tensor().is_constant());
    assert!(!g.op(1).is_constant());
    assert!(!g.value(y).logical_tensor().is_constant());
}
