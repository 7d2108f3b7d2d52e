use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fusebox_core::driver::{LoweredModule, LoweringDriver, ReferenceDriver, TuningParams};
use fusebox_core::ir::BackendGraph;
use fusebox_core::jit::CpuJit;
use fusebox_core::{
    bail, CompileConfig, CompileContext, CountingAllocator, DataType, DeviceEngine, EngineKind,
    EngineRegistry, Error, LogicalTensor, Op, OpAttr, OpGraph, OpKind, Partition, Result, Status,
    Stream, Tensor,
};

/// Reference driver that counts its invocations and can be told to fail.
#[derive(Default)]
struct CountingDriver {
    calls: AtomicUsize,
    fail: bool,
}

impl LoweringDriver for CountingDriver {
    fn lower(
        &self,
        graph: BackendGraph,
        tuning: &TuningParams,
        args: &[usize],
    ) -> Result<LoweredModule> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("lowering exploded")
        }
        ReferenceDriver.lower(graph, tuning, args)
    }
}

fn context(registry: Arc<EngineRegistry>, driver: Arc<CountingDriver>) -> CompileContext {
    CompileContext::new(
        registry,
        driver,
        Arc::new(CpuJit::default()),
        CompileConfig::default(),
    )
}

fn relu_partition(n: i64) -> Partition {
    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [n], DataType::F32));
    let y = g.add_value(LogicalTensor::unknown(1, DataType::F32));
    g.add_op(Op::new(OpKind::Relu), &[x], &[y]).unwrap();
    Partition::from_graph(EngineKind::Cpu, g)
}

#[test]
fn partitions_share_engine_until_last_release() {
    let registry = Arc::new(EngineRegistry::new());
    let ctx = context(registry.clone(), Arc::default());
    let allocator = Arc::new(CountingAllocator::new());
    let device = DeviceEngine::with_allocator(EngineKind::Cpu, allocator.clone());

    let p1 = relu_partition(4);
    let p2 = relu_partition(8);
    let c1 = p1.compile(&ctx, p1.inputs(), p1.outputs(), &device).unwrap();
    let c2 = p2.compile(&ctx, p2.inputs(), p2.outputs(), &device).unwrap();
    assert!(Arc::ptr_eq(c1.engine(), c2.engine()));
    assert_eq!(registry.active_partitions(device.id()), 2);
    assert_eq!(registry.cached_engines(), 1);

    let x = Tensor::from_f32(p1.inputs()[0].clone(), &[1., -1., 2., -2.]).unwrap();
    let y = Tensor::zeros(c1.outputs()[0].clone()).unwrap();
    c1.execute(&Stream::new(&device), &[x], &[y.clone()]).unwrap();
    assert_eq!(y.to_f32(), vec![1., 0., 2., 0.]);
    assert!(allocator.live_bytes() > 0);

    drop(c1);
    assert_eq!(registry.active_partitions(device.id()), 1);
    assert!(registry.contains(device.id()));

    drop(c2);
    assert_eq!(registry.active_partitions(device.id()), 0);
    assert!(!registry.contains(device.id()));
    assert_eq!(allocator.live_bytes(), 0);
}

#[test]
fn failed_lowering_does_not_leak_engine() {
    let registry = Arc::new(EngineRegistry::new());
    let driver = Arc::new(CountingDriver {
        fail: true,
        ..Default::default()
    });
    let ctx = context(registry.clone(), driver.clone());
    let device = DeviceEngine::new(EngineKind::Cpu);
    let p = relu_partition(4);

    let err = p
        .compile(&ctx, p.inputs(), p.outputs(), &device)
        .unwrap_err();
    assert_eq!(err.status(), Status::Unimplemented);
    match err.inner() {
        Error::Unimplemented { cause } => assert!(cause.to_string().contains("lowering exploded")),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.active_partitions(device.id()), 0);
    assert_eq!(registry.cached_engines(), 0);
}

#[test]
fn unsupported_kind_never_reaches_driver() {
    let registry = Arc::new(EngineRegistry::new());
    let driver = Arc::new(CountingDriver::default());
    let ctx = context(registry.clone(), driver.clone());

    let mut g = OpGraph::empty();
    let x = g.add_value(LogicalTensor::new(0, [1, 8, 8, 3], DataType::F32));
    let w = g.add_value(LogicalTensor::new(1, [3, 3, 3, 4], DataType::F32));
    let y = g.add_value(LogicalTensor::unknown(2, DataType::F32));
    let conv = Op::new(OpKind::Convolution)
        .with_attr(OpAttr::Strides, vec![1i64, 1])
        .with_attr(OpAttr::PadsBegin, vec![0i64, 0])
        .with_attr(OpAttr::PadsEnd, vec![0i64, 0])
        .with_attr(OpAttr::Dilations, vec![1i64, 1])
        .with_attr(OpAttr::DataFormat, "NXC")
        .with_attr(OpAttr::WeightsFormat, "XIO");
    g.add_op(conv, &[x, w], &[y]).unwrap();
    let p = Partition::from_graph(EngineKind::Cpu, g);

    let device = DeviceEngine::new(EngineKind::Cpu);
    let err = p
        .compile(&ctx, p.inputs(), p.outputs(), &device)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedOp {
            kind: OpKind::Convolution
        }
    ));
    assert_eq!(err.status(), Status::Unimplemented);
    assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
    assert_eq!(registry.cached_engines(), 0);
}

#[test]
fn non_cpu_device_is_rejected() {
    let registry = Arc::new(EngineRegistry::new());
    let ctx = context(registry.clone(), Arc::default());
    let device = DeviceEngine::new(EngineKind::Gpu);
    let p = relu_partition(4);
    let err = p
        .compile(&ctx, p.inputs(), p.outputs(), &device)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DeviceUnsupported {
            kind: EngineKind::Gpu
        }
    ));
    assert_eq!(registry.cached_engines(), 0);
}

#[test]
fn dangling_input_is_invalid_graph() {
    let registry = Arc::new(EngineRegistry::new());
    let ctx = context(registry, Arc::default());

    let mut g = OpGraph::empty();
    let a = g.add_value(LogicalTensor::new(0, [4], DataType::F32));
    let b = g.add_value(LogicalTensor::new(1, [4], DataType::F32));
    let c = g.add_value(LogicalTensor::unknown(2, DataType::F32));
    g.add_op(Op::new(OpKind::Add), &[a, b], &[c]).unwrap();
    let inputs = vec![g.value(a).logical_tensor().clone()];
    let outputs = vec![g.value(c).logical_tensor().clone()];
    // `b` is neither produced inside nor listed as a boundary input
    let p = Partition::new(EngineKind::Cpu, g, inputs.clone(), outputs.clone());

    let err = p
        .compile(&ctx, &inputs, &outputs, &DeviceEngine::new(EngineKind::Cpu))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidGraph(_)));
    assert_eq!(err.status(), Status::InvalidGraph);
}

#[test]
fn shape_errors_are_reported_verbatim() {
    let ctx = context(Arc::new(EngineRegistry::new()), Arc::default());
    let mut g = OpGraph::empty();
    let a = g.add_value(LogicalTensor::new(0, [2, 3], DataType::F32));
    let b = g.add_value(LogicalTensor::new(1, [4, 5], DataType::F32));
    let c = g.add_value(LogicalTensor::unknown(2, DataType::F32));
    g.add_op(Op::new(OpKind::MatMul), &[a, b], &[c]).unwrap();
    let p = Partition::from_graph(EngineKind::Cpu, g);

    let err = p
        .compile(
            &ctx,
            p.inputs(),
            p.outputs(),
            &DeviceEngine::new(EngineKind::Cpu),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ShapeInference {
            kind: OpKind::MatMul,
            ..
        }
    ));
    assert_eq!(err.status(), Status::InvalidShape);
}
