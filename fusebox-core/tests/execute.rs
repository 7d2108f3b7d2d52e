use std::sync::{Arc, Mutex};
use std::thread;

use fusebox_core::driver::{LoweredModule, ParamKind};
use fusebox_core::jit::{CpuJit, JitEngine, JitFunction};
use fusebox_core::{
    CompileConfig, CompileContext, DataType, DeviceEngine, EngineKind, EngineRegistry,
    LogicalTensor, Op, OpAttr, OpGraph, OpKind, Partition, Result, Status, Stream, Tensor,
};

fn ctx() -> CompileContext {
    CompileContext::with_registry(Arc::new(EngineRegistry::new()), CompileConfig::default())
}

fn approx_eq(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
    }
}

/// softmax(relu(x @ w + bias)) with a constant weight.
fn mlp_partition() -> Partition {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [2, 3], DataType::F32));
    let w = g.add_value(LogicalTensor::new(1, [3, 2], DataType::F32).constant());
    let b = g.add_value(LogicalTensor::new(2, [2], DataType::F32));
    let mm = g.add_value(LogicalTensor::unknown(3, DataType::F32));
    let biased = g.add_value(LogicalTensor::unknown(4, DataType::F32));
    let act = g.add_value(LogicalTensor::unknown(5, DataType::F32));
    let y = g.add_value(LogicalTensor::unknown(6, DataType::F32));
    g.add_op(Op::new(OpKind::SoftMax).with_attr(OpAttr::Axis, -1i64), &[act], &[y])
        .unwrap();
    g.add_op(Op::new(OpKind::MatMul), &[x, w], &[mm]).unwrap();
    g.add_op(Op::new(OpKind::BiasAdd), &[mm, b], &[biased]).unwrap();
    g.add_op(Op::new(OpKind::Relu), &[biased], &[act]).unwrap();
    Partition::from_graph(EngineKind::Cpu, g)
}

fn softmax_row(row: &[f32]) -> Vec<f32> {
    let sum: f32 = row.iter().map(|x| x.exp()).sum();
    row.iter().map(|x| x.exp() / sum).collect()
}

#[test]
fn mlp_end_to_end() {
    let p = mlp_partition();
    assert_eq!(p.inputs().len(), 3);
    let device = DeviceEngine::new(EngineKind::Cpu);
    let compiled = p.compile(&ctx(), p.inputs(), p.outputs(), &device).unwrap();
    assert_eq!(compiled.outputs()[0].vdims(), &[2, 2]);

    let x = Tensor::from_f32(p.inputs()[0].clone(), &[1., 2., 3., -1., 0., 1.]).unwrap();
    let w = Tensor::from_f32(p.inputs()[1].clone(), &[1., 0., 0., 1., 1., 1.]).unwrap();
    let b = Tensor::from_f32(p.inputs()[2].clone(), &[0.5, -1.]).unwrap();
    let y = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
    compiled
        .execute(&Stream::new(&device), &[x, w, b], &[y.clone()])
        .unwrap();

    // x @ w = [[4, 5], [0, 1]], + bias = [[4.5, 4], [0.5, 0]]
    let mut expected = softmax_row(&[4.5, 4.0]);
    expected.extend(softmax_row(&[0.5, 0.0]));
    approx_eq(&y.to_f32(), &expected);
}

#[test]
fn strided_output_is_written_in_its_layout() {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [2, 3], DataType::F32));
    let y = g.add_value(LogicalTensor::new(1, [2, 3], DataType::F32).with_strides([1, 2]));
    g.add_op(Op::new(OpKind::Relu), &[x], &[y]).unwrap();
    let p = Partition::from_graph(EngineKind::Cpu, g);
    let device = DeviceEngine::new(EngineKind::Cpu);
    let compiled = p.compile(&ctx(), p.inputs(), p.outputs(), &device).unwrap();
    assert_eq!(compiled.outputs()[0].strides(), Some(&[1, 2][..]));

    let x = Tensor::from_f32(p.inputs()[0].clone(), &[1., -2., 3., -4., 5., -6.]).unwrap();
    let y = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
    compiled
        .execute(&Stream::new(&device), &[x], &[y.clone()])
        .unwrap();
    assert_eq!(y.to_f32(), vec![1., 0., 3., 0., 5., 0.]);
    let raw = y.buffer().read();
    let stored: Vec<f32> = (0..6).map(|i| DataType::F32.read(&raw, i)).collect();
    assert_eq!(stored, vec![1., 0., 0., 5., 3., 0.]);
}

#[test]
fn quantize_dequantize_round_trip() {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [4], DataType::F32));
    let q = g.add_value(LogicalTensor::unknown(1, DataType::U8));
    let d = g.add_value(LogicalTensor::unknown(2, DataType::F32));
    let quant = |kind| {
        Op::new(kind)
            .with_attr(OpAttr::Qtype, "per_tensor")
            .with_attr(OpAttr::Scales, vec![0.5f32])
            .with_attr(OpAttr::Zps, vec![10i64])
    };
    g.add_op(quant(OpKind::Quantize), &[x], &[q]).unwrap();
    g.add_op(quant(OpKind::Dequantize), &[q], &[d]).unwrap();
    let inputs = vec![g.value(x).logical_tensor().clone()];
    let outputs = vec![
        g.value(q).logical_tensor().clone(),
        g.value(d).logical_tensor().clone(),
    ];
    let p = Partition::new(EngineKind::Cpu, g, inputs, outputs);

    let device = DeviceEngine::new(EngineKind::Cpu);
    let compiled = p.compile(&ctx(), p.inputs(), p.outputs(), &device).unwrap();
    assert_eq!(compiled.outputs()[0].data_type, DataType::U8);

    let x = Tensor::from_f32(p.inputs()[0].clone(), &[0.0, 1.0, -2.4, 100.0]).unwrap();
    let q = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
    let d = Tensor::zeros(compiled.outputs()[1].clone()).unwrap();
    compiled
        .execute(&Stream::new(&device), &[x], &[q.clone(), d.clone()])
        .unwrap();
    assert_eq!(q.to_f32(), vec![10., 12., 5., 210.]);
    assert_eq!(d.to_f32(), vec![0.0, 1.0, -2.5, 100.0]);
}

#[test]
fn type_cast_rounds_through_bf16() {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [4], DataType::F32));
    let y = g.add_value(LogicalTensor::unknown(1, DataType::Bf16));
    g.add_op(Op::new(OpKind::TypeCast), &[x], &[y]).unwrap();
    let p = Partition::from_graph(EngineKind::Cpu, g);
    let device = DeviceEngine::new(EngineKind::Cpu);
    let compiled = p.compile(&ctx(), p.inputs(), p.outputs(), &device).unwrap();
    assert_eq!(compiled.outputs()[0].data_type, DataType::Bf16);
    assert_eq!(compiled.outputs()[0].vdims(), &[4]);

    let data = [1.0f32, -2.5, 1.001, 3.3];
    let x = Tensor::from_f32(p.inputs()[0].clone(), &data).unwrap();
    let y = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
    assert_eq!(y.buffer().len(), 8);
    compiled
        .execute(&Stream::new(&device), &[x], &[y.clone()])
        .unwrap();
    let expected: Vec<f32> = data
        .iter()
        .map(|v| half::bf16::from_f32(*v).to_f32())
        .collect();
    assert_eq!(y.to_f32(), expected);
    assert_eq!(y.to_f32()[2], 1.0);
}

#[test]
fn out_of_range_quantize_axis_fails_inference() {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [4, 2], DataType::F32));
    let q = g.add_value(LogicalTensor::unknown(1, DataType::U8));
    g.add_op(
        Op::new(OpKind::Quantize)
            .with_attr(OpAttr::Qtype, "per_channel")
            .with_attr(OpAttr::Axis, 2i64)
            .with_attr(OpAttr::Scales, vec![0.5f32, 0.25])
            .with_attr(OpAttr::Zps, vec![0i64, 0]),
        &[x],
        &[q],
    )
    .unwrap();
    let p = Partition::from_graph(EngineKind::Cpu, g);
    let device = DeviceEngine::new(EngineKind::Cpu);
    let ctx = ctx();
    let err = p
        .compile(&ctx, p.inputs(), p.outputs(), &device)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidShape);
    assert_eq!(ctx.registry.cached_engines(), 0);
}

#[test]
fn reduce_transpose_reshape_chain() {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [2, 3], DataType::F32));
    let t = g.add_value(LogicalTensor::unknown(1, DataType::F32));
    let r = g.add_value(LogicalTensor::unknown(2, DataType::F32));
    let s = g.add_value(LogicalTensor::unknown(3, DataType::F32));
    g.add_op(
        Op::new(OpKind::StaticTranspose).with_attr(OpAttr::Order, vec![1i64, 0]),
        &[x],
        &[t],
    )
    .unwrap();
    g.add_op(
        Op::new(OpKind::StaticReshape)
            .with_attr(OpAttr::Shape, vec![-1i64])
            .with_attr(OpAttr::SpecialZero, false),
        &[t],
        &[r],
    )
    .unwrap();
    g.add_op(
        Op::new(OpKind::ReduceSum)
            .with_attr(OpAttr::Axes, vec![0i64])
            .with_attr(OpAttr::KeepDims, true),
        &[r],
        &[s],
    )
    .unwrap();
    let p = Partition::new(
        EngineKind::Cpu,
        g.clone(),
        vec![g.value(x).logical_tensor().clone()],
        vec![
            g.value(r).logical_tensor().clone(),
            g.value(s).logical_tensor().clone(),
        ],
    );
    let device = DeviceEngine::new(EngineKind::Cpu);
    let compiled = p.compile(&ctx(), p.inputs(), p.outputs(), &device).unwrap();
    assert_eq!(compiled.outputs()[0].vdims(), &[6]);
    assert_eq!(compiled.outputs()[1].vdims(), &[1]);

    let x = Tensor::from_f32(p.inputs()[0].clone(), &[1., 2., 3., 4., 5., 6.]).unwrap();
    let r = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
    let s = Tensor::zeros(compiled.outputs()[1].clone()).unwrap();
    compiled
        .execute(&Stream::new(&device), &[x], &[r.clone(), s.clone()])
        .unwrap();
    assert_eq!(r.to_f32(), vec![1., 4., 2., 5., 3., 6.]);
    assert_eq!(s.to_f32(), vec![21.]);
}

#[test]
fn concurrent_execute_on_one_partition() {
    let p = mlp_partition();
    let device = DeviceEngine::new(EngineKind::Cpu);
    let compiled = p.compile(&ctx(), p.inputs(), p.outputs(), &device).unwrap();
    let w = Tensor::from_f32(p.inputs()[1].clone(), &[1., 0., 0., 1., 0., 0.]).unwrap();
    let b = Tensor::from_f32(p.inputs()[2].clone(), &[0., 0.]).unwrap();

    thread::scope(|s| {
        for i in 0..8 {
            let (compiled, p, device, w, b) = (&compiled, &p, &device, w.clone(), b.clone());
            s.spawn(move || {
                let v = i as f32;
                let x = Tensor::from_f32(p.inputs()[0].clone(), &[v, 0., 0., 0., v, 0.])
                    .unwrap();
                let y = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
                for _ in 0..16 {
                    let inputs = [x.clone(), w.clone(), b.clone()];
                    compiled
                        .execute(&Stream::new(device), &inputs, &[y.clone()])
                        .unwrap();
                }
                let mut expected = softmax_row(&[v, 0.]);
                expected.extend(softmax_row(&[0., v]));
                approx_eq(&y.to_f32(), &expected);
            });
        }
    });
}

/// Records the modules it is asked to compile, then defers to [`CpuJit`].
#[derive(Default)]
struct RecordingJit {
    inner: CpuJit,
    seen: Mutex<Vec<LoweredModule>>,
}

impl JitEngine for RecordingJit {
    fn get_entry_func(
        &self,
        module: &LoweredModule,
        generate_wrapper: bool,
    ) -> Result<Arc<dyn JitFunction>> {
        self.seen.lock().unwrap().push(module.clone());
        self.inner.get_entry_func(module, generate_wrapper)
    }
}

#[test]
fn arguments_are_outputs_then_inputs_in_caller_order() {
    let mut g = OpGraph::empty();
    let i0 = g.add_value(LogicalTensor::new(10, [2, 3], DataType::F32));
    let i1 = g.add_value(LogicalTensor::new(11, [3], DataType::F32));
    let i2 = g.add_value(LogicalTensor::new(12, [5], DataType::F32));
    let o0 = g.add_value(LogicalTensor::unknown(20, DataType::F32));
    let o1 = g.add_value(LogicalTensor::unknown(21, DataType::F32));
    g.add_op(Op::new(OpKind::Add), &[i0, i1], &[o1]).unwrap();
    g.add_op(Op::new(OpKind::Sigmoid), &[i2], &[o0]).unwrap();
    let lt = |v| g.value(v).logical_tensor().clone();
    let (l0, l1, l2, m0, m1) = (lt(i0), lt(i1), lt(i2), lt(o0), lt(o1));
    let p = Partition::new(
        EngineKind::Cpu,
        g.clone(),
        vec![l0.clone(), l1.clone(), l2.clone()],
        vec![m0.clone(), m1.clone()],
    );

    let jit = Arc::new(RecordingJit::default());
    let mut ctx = ctx();
    ctx.jit = jit.clone();
    let device = DeviceEngine::new(EngineKind::Cpu);

    let compiled = p
        .compile(&ctx, &[l0.clone(), l1.clone(), l2.clone()], &[m0.clone(), m1.clone()], &device)
        .unwrap();
    let _reordered = p
        .compile(&ctx, &[l2.clone(), l0.clone(), l1.clone()], &[m1.clone(), m0.clone()], &device)
        .unwrap();

    let seen = jit.seen.lock().unwrap();
    let shape = |m: &LoweredModule| -> Vec<(ParamKind, Vec<i64>)> {
        m.params.iter().map(|p| (p.kind, p.dims.clone())).collect()
    };
    assert_eq!(
        shape(&seen[0]),
        vec![
            (ParamKind::Output, vec![5]),
            (ParamKind::Output, vec![2, 3]),
            (ParamKind::Input, vec![2, 3]),
            (ParamKind::Input, vec![3]),
            (ParamKind::Input, vec![5]),
        ]
    );
    assert_eq!(
        shape(&seen[1]),
        vec![
            (ParamKind::Output, vec![2, 3]),
            (ParamKind::Output, vec![5]),
            (ParamKind::Input, vec![5]),
            (ParamKind::Input, vec![2, 3]),
            (ParamKind::Input, vec![3]),
        ]
    );

    // and execution binds buffers the same way
    let x0 = Tensor::from_f32(l0, &[1., 2., 3., 4., 5., 6.]).unwrap();
    let x1 = Tensor::from_f32(l1, &[10., 20., 30.]).unwrap();
    let x2 = Tensor::from_f32(l2, &[0.; 5]).unwrap();
    let y0 = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
    let y1 = Tensor::zeros(compiled.outputs()[1].clone()).unwrap();
    compiled
        .execute(&Stream::new(&device), &[x0, x1, x2], &[y0.clone(), y1.clone()])
        .unwrap();
    assert_eq!(y0.to_f32(), vec![0.5; 5]);
    assert_eq!(y1.to_f32(), vec![11., 22., 33., 14., 25., 36.]);
}
