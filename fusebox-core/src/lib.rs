//! Fusebox compiles fused partitions of a tensor-operation graph into callable entry points.
//!
//! A [`Partition`] is a small op graph plus the logical tensors on its boundary. Compiling it runs
//! a fixed pipeline:
//!
//! 1. shape inference over a private copy of the graph ([`shape_infer`]),
//! 2. translation into the backend IR ([`translate`], [`ir`]), with structural checks,
//! 3. engine resolution through an [`EngineRegistry`] shared by every partition on a device,
//! 4. optimization and lowering ([`driver`]), including [`constant_prop`]agation,
//! 5. JIT compilation of the lowered module into an entry point ([`jit`]).
//!
//! The resulting [`CompiledPartition`] is run with [`CompiledPartition::execute`], which passes
//! buffers to the entry point outputs first, then inputs.
//!
//! ## A quick guide
//! ```
//! use fusebox_core::{
//!     CompileContext, DataType, DeviceEngine, EngineKind, LogicalTensor, Op, OpGraph, OpKind,
//!     Partition, Stream, Tensor,
//! };
//!
//! let mut graph = OpGraph::empty();
//! let x = graph.add_value(LogicalTensor::new(0, [2, 2], DataType::F32));
//! let y = graph.add_value(LogicalTensor::unknown(1, DataType::F32));
//! graph.add_op(Op::new(OpKind::Relu), &[x], &[y]).unwrap();
//! let partition = Partition::from_graph(EngineKind::Cpu, graph);
//!
//! let device = DeviceEngine::new(EngineKind::Cpu);
//! let compiled = partition
//!     .compile(
//!         &CompileContext::default(),
//!         partition.inputs(),
//!         partition.outputs(),
//!         &device,
//!     )
//!     .unwrap();
//!
//! let input = Tensor::from_f32(partition.inputs()[0].clone(), &[-1., 2., -3., 4.]).unwrap();
//! let output = Tensor::zeros(compiled.outputs()[0].clone()).unwrap();
//! compiled
//!     .execute(&Stream::new(&device), &[input], &[output.clone()])
//!     .unwrap();
//! assert_eq!(output.to_f32(), vec![0., 2., 0., 4.]);
//! ```

mod compiled;
pub mod constant_prop;
mod dtype;
pub mod driver;
pub mod engine;
mod error;
mod graph;
pub mod ir;
pub mod jit;
pub mod kernels;
mod logical_tensor;
mod op;
mod partition;
pub mod shape_infer;
mod tensor;
pub mod translate;

pub use compiled::CompiledPartition;
pub use dtype::DataType;
pub use engine::{
    Allocator, CountingAllocator, DeviceEngine, EngineKind, EngineLease, EngineRegistry,
    GraphEngine,
};
pub use error::{Context, Error, Result, Status};
pub use graph::{OpGraph, Value, ValueId};
pub use logical_tensor::{dense_strides, Layout, LogicalTensor, Property, DIM_UNKNOWN};
pub use op::{AttrValue, Attributes, Op, OpAttr, OpKind};
pub use partition::{CompileConfig, CompileContext, Partition};
pub use tensor::{Buffer, Stream, Tensor};
