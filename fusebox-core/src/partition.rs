use std::fmt::{self, Display};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::compiled::CompiledPartition;
use crate::driver::{LoweringDriver, ReferenceDriver, TuningParams};
use crate::engine::{DeviceEngine, EngineKind, EngineRegistry};
use crate::jit::{CpuJit, JitEngine, JitFunction, DEFAULT_MAX_CACHED_MODULES};
use crate::shape_infer::infer_graph;
use crate::translate::{check_supported, translate, Translation};
use crate::{Context, Error, LogicalTensor, OpGraph, Result};

/// Compiler knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileConfig {
    pub tuning: TuningParams,
    /// Where to write a listing of every newly compiled module.
    pub module_dump_dir: Option<PathBuf>,
    pub max_cached_modules: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            tuning: TuningParams::default(),
            module_dump_dir: None,
            max_cached_modules: DEFAULT_MAX_CACHED_MODULES,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl CompileConfig {
    /// Defaults overridden by `FUSEBOX_DUMP_MODULES`, `FUSEBOX_BATCH_SIZE` and `FUSEBOX_REPEAT`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if std::env::var("FUSEBOX_DUMP_MODULES").is_ok_and(|v| v == "1") {
            config.module_dump_dir =
                dirs::home_dir().map(|home| home.join(".cache").join("fusebox").join("modules"));
        }
        if let Some(batch_size) = env_usize("FUSEBOX_BATCH_SIZE") {
            config.tuning.batch_size = batch_size;
        }
        if let Some(repeat) = env_usize("FUSEBOX_REPEAT") {
            config.tuning.repeat = repeat;
        }
        config
    }
}

/// Collaborators of [`Partition::compile`].
#[derive(Clone)]
pub struct CompileContext {
    pub registry: Arc<EngineRegistry>,
    pub driver: Arc<dyn LoweringDriver>,
    pub jit: Arc<dyn JitEngine>,
    pub config: CompileConfig,
}

impl CompileContext {
    pub fn new(
        registry: Arc<EngineRegistry>,
        driver: Arc<dyn LoweringDriver>,
        jit: Arc<dyn JitEngine>,
        config: CompileConfig,
    ) -> Self {
        Self {
            registry,
            driver,
            jit,
            config,
        }
    }

    /// Reference driver and [`CpuJit`] over `registry`.
    pub fn with_registry(registry: Arc<EngineRegistry>, config: CompileConfig) -> Self {
        let jit = CpuJit::new(config.max_cached_modules, config.module_dump_dir.clone());
        Self::new(registry, Arc::new(ReferenceDriver), Arc::new(jit), config)
    }
}

impl Default for CompileContext {
    fn default() -> Self {
        Self::with_registry(EngineRegistry::shared(), CompileConfig::from_env())
    }
}

impl fmt::Debug for CompileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileContext")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

static NEXT_PARTITION_ID: AtomicUsize = AtomicUsize::new(0);

/// A unit of compilation: ops plus boundary tensors.
///
/// The caller's graph is never mutated. Every `infer_shape`/`compile` call works on a fresh deep
/// copy that is kept afterwards as the partition's working graph.
#[derive(Debug)]
pub struct Partition {
    id: usize,
    engine_kind: EngineKind,
    graph: OpGraph,
    inputs: Vec<LogicalTensor>,
    outputs: Vec<LogicalTensor>,
    working: Mutex<Option<OpGraph>>,
}

impl Partition {
    pub fn new(
        engine_kind: EngineKind,
        graph: OpGraph,
        inputs: Vec<LogicalTensor>,
        outputs: Vec<LogicalTensor>,
    ) -> Self {
        Self {
            id: NEXT_PARTITION_ID.fetch_add(1, Ordering::Relaxed),
            engine_kind,
            graph,
            inputs,
            outputs,
            working: Mutex::new(None),
        }
    }

    /// Boundary inputs are values with no producer, outputs are values with no consumer.
    pub fn from_graph(engine_kind: EngineKind, graph: OpGraph) -> Self {
        let collect = |values: Vec<crate::ValueId>| {
            values
                .into_iter()
                .map(|v| graph.value(v).logical_tensor().clone())
                .collect::<Vec<_>>()
        };
        let inputs = collect(graph.input_values());
        let outputs = collect(graph.output_values());
        Self::new(engine_kind, graph, inputs, outputs)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine_kind
    }

    pub fn graph(&self) -> &OpGraph {
        &self.graph
    }

    pub fn inputs(&self) -> &[LogicalTensor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[LogicalTensor] {
        &self.outputs
    }

    /// The graph left by the last `infer_shape`/`compile`, if any.
    pub fn working_graph(&self) -> Option<OpGraph> {
        self.working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Infer output shapes for the given concrete inputs. Matching entries of `outputs` are
    /// overwritten with the inferred tensors.
    pub fn infer_shape(
        &self,
        inputs: &[LogicalTensor],
        outputs: &mut [LogicalTensor],
    ) -> Result<()> {
        let mut working = self.working.lock().unwrap_or_else(PoisonError::into_inner);
        let mut graph = self.graph.clone();
        infer_graph(&mut graph, inputs, outputs)?;
        *working = Some(graph);
        Ok(())
    }

    /// Compile for `device`.
    ///
    /// Inference, support and structural errors are returned as they are; every failure after
    /// translation starts is reported as [`Error::Unimplemented`] with the cause attached.
    pub fn compile(
        &self,
        ctx: &CompileContext,
        inputs: &[LogicalTensor],
        outputs: &[LogicalTensor],
        device: &DeviceEngine,
    ) -> Result<CompiledPartition> {
        let mut outputs = outputs.to_vec();
        let translation = {
            let mut working = self.working.lock().unwrap_or_else(PoisonError::into_inner);
            let mut graph = self.graph.clone();
            infer_graph(&mut graph, inputs, &mut outputs)?;
            log::debug!("partition {}: shapes inferred", self.id);

            check_supported(&graph)?;
            let translation = translate(&graph, inputs, &outputs).map_err(Error::unimplemented)?;
            translation.graph.check_connection()?;
            *working = Some(graph);
            translation
        };

        if device.kind() != EngineKind::Cpu {
            return Err(Error::DeviceUnsupported { kind: device.kind() });
        }
        let lease = ctx.registry.acquire(device);

        let entry = (|| -> Result<Arc<dyn JitFunction>> {
            let args = calling_convention(inputs, &outputs, &translation)?;
            let module = ctx.driver.lower(translation.graph, &ctx.config.tuning, &args)?;
            ctx.jit.get_entry_func(&module, true)
        })()
        .map_err(|e| {
            log::warn!("partition {}: compilation failed: {e}", self.id);
            Error::unimplemented(e)
        })?;

        log::debug!("partition {}: compiled to {}", self.id, entry.name());
        Ok(CompiledPartition::new(inputs.to_vec(), outputs, entry, lease))
    }
}

/// Unique ids of the boundary ops, outputs first then inputs, each in caller order.
fn calling_convention(
    inputs: &[LogicalTensor],
    outputs: &[LogicalTensor],
    translation: &Translation,
) -> Result<Vec<usize>> {
    let mut args = Vec::with_capacity(inputs.len() + outputs.len());
    for o in outputs {
        let uid = translation
            .outputs
            .get(&o.id)
            .with_context(|| format!("output {} is not produced by the partition", o.id))?;
        args.push(*uid);
    }
    for i in inputs {
        let uid = translation
            .inputs
            .get(&i.id)
            .with_context(|| format!("input {} is not an input of the partition", i.id))?;
        args.push(*uid);
    }
    Ok(args)
}

impl Clone for Partition {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            engine_kind: self.engine_kind,
            graph: self.graph.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            working: Mutex::new(None),
        }
    }
}

fn dims_to_string(dims: &[i64]) -> String {
    let dims: Vec<String> = dims.iter().map(i64::to_string).collect();
    format!("({})", dims.join("x"))
}

impl Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in self.graph.ops() {
            write!(f, " [ op: (ID: {}, kind: {} ), ", op.id(), op.kind())?;
        }
        writeln!(f, " ] ")?;

        for (label, tensors) in [("inputs", &self.inputs), ("outputs", &self.outputs)] {
            write!(f, "  [ {label}: ")?;
            let mut delimiter = "";
            for t in tensors {
                write!(
                    f,
                    "{delimiter}(ID: {}({}:{}",
                    t.id,
                    t.data_type,
                    dims_to_string(t.vdims())
                )?;
                delimiter = ")), ";
            }
            writeln!(f, " ]")?;
        }
        writeln!(f, " ]")?;
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Op, OpKind};
    use crate::DataType;

    fn relu_partition() -> Partition {
        let mut g = OpGraph::empty();
        let x = g.add_value(LogicalTensor::new(0, [2, 3], DataType::F32));
        let y = g.add_value(LogicalTensor::unknown(1, DataType::F32));
        g.add_op(Op::new(OpKind::Relu), &[x], &[y]).unwrap();
        Partition::from_graph(EngineKind::Cpu, g)
    }

    #[test]
    fn from_graph_finds_boundary() {
        let p = relu_partition();
        assert_eq!(p.inputs().len(), 1);
        assert_eq!(p.outputs()[0].id, 1);
    }

    #[test]
    fn clone_keeps_identity() {
        let p = relu_partition();
        let c = p.clone();
        assert_eq!(c.id(), p.id());
        assert_eq!(c.graph(), p.graph());
        assert_eq!(c.to_string(), p.to_string());
    }

    #[test]
    fn display_format() {
        let p = relu_partition();
        let s = p.to_string();
        assert!(s.starts_with(" [ op: (ID: 0, kind: ReLU ),  ] \n"));
        assert!(s.contains("  [ inputs: (ID: 0(f32:(2x3) ]\n"));
        assert!(s.contains("  [ outputs: (ID: 1(f32:() ]\n"));
    }

    #[test]
    fn infer_shape_leaves_caller_graph_alone() {
        let p = relu_partition();
        let mut outs = vec![LogicalTensor::unknown(1, DataType::F32)];
        p.infer_shape(&[LogicalTensor::new(0, [4, 5], DataType::F32)], &mut outs)
            .unwrap();
        assert_eq!(outs[0].vdims(), &[4, 5]);
        assert!(!p.graph().values()[1].logical_tensor().is_shape_known());
        let working = p.working_graph().unwrap();
        assert_eq!(working.values()[1].logical_tensor().vdims(), &[4, 5]);
    }

    #[test]
    fn config_defaults() {
        let config = CompileConfig::default();
        assert_eq!(config.tuning, TuningParams { batch_size: 28, repeat: 10 });
        assert_eq!(config.max_cached_modules, 128);
        assert!(config.module_dump_dir.is_none());
    }
}
