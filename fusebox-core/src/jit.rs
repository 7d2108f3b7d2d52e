//! JIT compilation of lowered modules into callable entry points.
//!
//! [`CpuJit`] keeps compiled modules in a bounded cache keyed by module name. Its entry points
//! interpret the module's instruction list with the f32 kernels in [`crate::kernels`], drawing
//! scratch memory from the engine's runtime pool.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::driver::{Instruction, LoweredModule, ParamKind, ParamSpec};
use crate::engine::GraphEngine;
use crate::ir::BackendAttr;
use crate::kernels::{self, QuantParams};
use crate::tensor::{span, strided_offsets, Buffer, Stream, Tensor};
use crate::{bail, Context, DataType, Error, Result};

pub const DEFAULT_MAX_CACHED_MODULES: usize = 128;

/// One positional argument of a generic call.
#[derive(Debug, Clone)]
pub enum GenericVal {
    Ptr(Buffer),
    Int(i64),
    Float(f32),
}

impl From<&Tensor> for GenericVal {
    fn from(t: &Tensor) -> Self {
        Self::Ptr(t.buffer().clone())
    }
}

/// A backend stream view bound to one graph engine.
#[derive(Debug, Clone)]
pub struct GraphStream {
    stream: Stream,
    engine: Arc<GraphEngine>,
}

impl GraphStream {
    pub fn new(stream: &Stream, engine: Arc<GraphEngine>) -> Self {
        Self {
            stream: stream.clone(),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<GraphEngine> {
        &self.engine
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }
}

/// A compiled entry point.
pub trait JitFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Invoke with positional arguments in the module's parameter order.
    fn call_generic(&self, stream: &GraphStream, args: &[GenericVal]) -> Result<()>;
}

pub trait JitEngine: Send + Sync {
    fn get_entry_func(
        &self,
        module: &LoweredModule,
        generate_wrapper: bool,
    ) -> Result<Arc<dyn JitFunction>>;
}

const KNOWN_INSTRUCTIONS: [&str; 19] = [
    "add",
    "sub",
    "mul",
    "div",
    "matmul",
    "quantize",
    "dequantize",
    "static_reshape",
    "transpose",
    "softmax",
    "reorder",
    "cast",
    "relu",
    "sigmoid",
    "gelu",
    "relu_backprop",
    "sigmoid_backprop",
    "gelu_backprop",
    "reduce",
];

#[derive(Debug)]
struct InterpretedModule {
    module: LoweredModule,
    generic_wrapper: bool,
}

pub struct CpuJit {
    modules: RwLock<HashMap<String, Arc<InterpretedModule>>>,
    module_cache_order: Mutex<VecDeque<String>>,
    max_cached: usize,
    dump_dir: Option<PathBuf>,
}

impl fmt::Debug for CpuJit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuJit")
            .field("cached", &self.cached_modules())
            .field("max_cached", &self.max_cached)
            .field("dump_dir", &self.dump_dir)
            .finish()
    }
}

impl Default for CpuJit {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED_MODULES, None)
    }
}

impl CpuJit {
    pub fn new(max_cached: usize, dump_dir: Option<PathBuf>) -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            module_cache_order: Mutex::new(VecDeque::new()),
            max_cached,
            dump_dir,
        }
    }

    pub fn cached_modules(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn dump(&self, module: &LoweredModule) -> Result<()> {
        let Some(dir) = &self.dump_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        fs::write(dir.join(format!("{}.txt", module.name)), module.to_string())?;
        Ok(())
    }
}

impl JitEngine for CpuJit {
    fn get_entry_func(
        &self,
        module: &LoweredModule,
        generate_wrapper: bool,
    ) -> Result<Arc<dyn JitFunction>> {
        // If we've already compiled this module, skip recompiling
        {
            let modules_read = self.modules.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(compiled) = modules_read.get(&module.name) {
                if compiled.generic_wrapper == generate_wrapper {
                    log::debug!("jit cache hit for {}", module.name);
                    return Ok(compiled.clone());
                }
            }
        }

        for inst in &module.body {
            if !KNOWN_INSTRUCTIONS.contains(&inst.name) {
                bail!("no code generation for backend op `{}`", inst.name)
            }
        }
        self.dump(module)?;
        log::debug!(
            "jit compiled {} ({} instructions, {} constant)",
            module.name,
            module.body.len(),
            module.constant_instructions()
        );
        let compiled = Arc::new(InterpretedModule {
            module: module.clone(),
            generic_wrapper: generate_wrapper,
        });

        // Insert into cache and cap size
        {
            let mut modules_write = self.modules.write().unwrap_or_else(PoisonError::into_inner);
            let mut order = self
                .module_cache_order
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if modules_write
                .insert(module.name.clone(), compiled.clone())
                .is_none()
            {
                order.push_back(module.name.clone());
            }
            while order.len() > self.max_cached {
                if let Some(old) = order.pop_front() {
                    modules_write.remove(&old);
                }
            }
        }
        Ok(compiled)
    }
}

/// Contents of one value slot during a call.
/// A computed value. `data` is always drawn from the engine pool and goes back there.
struct Slot {
    data: Vec<f32>,
    dims: Vec<i64>,
}

fn int_attr(inst: &Instruction, name: &str) -> Result<Option<i32>> {
    match inst.attrs.get(name) {
        None => Ok(None),
        Some(BackendAttr::Int(v)) => Ok(Some(*v)),
        Some(other) => bail!("attribute `{name}` of `{}` is {other:?}", inst.name),
    }
}

fn ints_attr<'a>(inst: &'a Instruction, name: &str) -> Result<Option<&'a [i32]>> {
    match inst.attrs.get(name) {
        None => Ok(None),
        Some(BackendAttr::Ints(v)) => Ok(Some(v)),
        Some(other) => bail!("attribute `{name}` of `{}` is {other:?}", inst.name),
    }
}

fn bool_attr(inst: &Instruction, name: &str) -> Result<bool> {
    match inst.attrs.get(name) {
        None => Ok(false),
        Some(BackendAttr::Bool(v)) => Ok(*v),
        Some(other) => bail!("attribute `{name}` of `{}` is {other:?}", inst.name),
    }
}

fn dtype_attr(inst: &Instruction) -> Result<DataType> {
    match inst.attrs.get("dtype") {
        Some(BackendAttr::DataType(d)) => Ok(*d),
        other => bail!("`{}` needs a dtype attribute, got {other:?}", inst.name),
    }
}

impl InterpretedModule {
    fn load_param(&self, engine: &GraphEngine, param: &ParamSpec, buf: &Buffer) -> Result<Slot> {
        let bytes = buf.read();
        let needed = span(&param.dims, &param.strides) * param.dtype.size_in_bytes();
        if bytes.len() < needed {
            bail!(
                "argument #{} holds {} bytes, {needed} needed",
                param.unique_id,
                bytes.len()
            )
        }
        let offsets = strided_offsets(&param.dims, &param.strides);
        let mut data = engine.take_buffer(offsets.len())?;
        for (x, off) in data.iter_mut().zip(offsets) {
            *x = param.dtype.read(&bytes, off);
        }
        Ok(Slot {
            data,
            dims: param.dims.clone(),
        })
    }

    fn store_param(&self, param: &ParamSpec, slot: &Slot, buf: &Buffer) -> Result<()> {
        let mut bytes = buf.write();
        let needed = span(&param.dims, &param.strides) * param.dtype.size_in_bytes();
        if bytes.len() < needed {
            bail!(
                "output #{} holds {} bytes, {needed} needed",
                param.unique_id,
                bytes.len()
            )
        }
        for (x, off) in slot
            .data
            .iter()
            .zip(strided_offsets(&param.dims, &param.strides))
        {
            param.dtype.write(&mut bytes, off, *x);
        }
        Ok(())
    }

    /// Copy of `src` in a pool buffer, for kernels that work in place.
    fn pooled_copy(engine: &GraphEngine, src: &Slot) -> Result<Slot> {
        let mut data = engine.take_buffer(src.data.len())?;
        data.copy_from_slice(&src.data);
        Ok(Slot {
            data,
            dims: src.dims.clone(),
        })
    }

    /// Move a kernel result into a pool buffer.
    fn pooled(engine: &GraphEngine, (result, dims): (Vec<f32>, Vec<i64>)) -> Result<Slot> {
        let mut data = engine.take_buffer(result.len())?;
        data.copy_from_slice(&result);
        Ok(Slot { data, dims })
    }

    fn run(
        &self,
        engine: &GraphEngine,
        inst: &Instruction,
        slots: &[Option<Slot>],
    ) -> Result<Slot> {
        let arg = |i: usize| -> Result<&Slot> {
            inst.inputs
                .get(i)
                .and_then(|s| slots[*s].as_ref())
                .with_context(|| format!("input {i} of `{}` was never computed", inst.name))
        };
        let pooled = |result: (Vec<f32>, Vec<i64>)| Self::pooled(engine, result);
        let in_place = |f: fn(f32) -> f32| -> Result<Slot> {
            let mut out = Self::pooled_copy(engine, arg(0)?)?;
            kernels::map_unary(&mut out.data, f);
            Ok(out)
        };
        let binary = |f: fn(f32, f32) -> f32| -> Result<Slot> {
            let (l, r) = (arg(0)?, arg(1)?);
            let mut r_dims = r.dims.clone();
            if let Some(&[axis]) = ints_attr(inst, "bc_axis")? {
                r_dims = vec![1; l.dims.len()];
                if let Some(d) = r_dims.get_mut(axis as usize) {
                    *d = r.data.len() as i64;
                }
            }
            kernels::broadcast_binary(&l.data, &l.dims, &r.data, &r_dims, f).and_then(pooled)
        };

        match inst.name {
            "add" => binary(|a, b| a + b),
            "sub" => binary(|a, b| a - b),
            "mul" => binary(|a, b| a * b),
            "div" => binary(|a, b| a / b),
            "relu_backprop" => binary(kernels::relu_backprop),
            "sigmoid_backprop" => binary(kernels::sigmoid_backprop),
            "gelu_backprop" => binary(kernels::gelu_backprop),
            "relu" => in_place(kernels::relu),
            "sigmoid" => in_place(kernels::sigmoid),
            "gelu" => in_place(kernels::gelu),
            "reorder" => Self::pooled_copy(engine, arg(0)?),
            "matmul" => {
                let (a, b) = (arg(0)?, arg(1)?);
                kernels::matmul(
                    &a.data,
                    &a.dims,
                    &b.data,
                    &b.dims,
                    bool_attr(inst, "transpose_a")?,
                    bool_attr(inst, "transpose_b")?,
                )
                .and_then(pooled)
            }
            "static_reshape" => {
                let mut out = Self::pooled_copy(engine, arg(0)?)?;
                out.dims = inst
                    .outputs
                    .first()
                    .and_then(|s| self.module.slots.get(*s))
                    .cloned()
                    .context("reshape without an output slot")?;
                Ok(out)
            }
            "transpose" => {
                let src = arg(0)?;
                let order: Vec<usize> = ints_attr(inst, "order")?
                    .context("transpose without order")?
                    .iter()
                    .map(|a| *a as usize)
                    .collect();
                pooled(kernels::transpose(&src.data, &src.dims, &order))
            }
            "softmax" => {
                let axis = ints_attr(inst, "axis")?
                    .and_then(|a| a.first().copied())
                    .unwrap_or(1) as usize;
                let mut out = Self::pooled_copy(engine, arg(0)?)?;
                kernels::softmax(&mut out.data, &out.dims, axis);
                Ok(out)
            }
            "reduce" => {
                let src = arg(0)?;
                let axes: Vec<usize> = ints_attr(inst, "rd_axis")?
                    .context("reduce without rd_axis")?
                    .iter()
                    .map(|a| *a as usize)
                    .collect();
                let keep_dims = bool_attr(inst, "keep_dims")?;
                pooled(kernels::reduce_sum(&src.data, &src.dims, &axes, keep_dims))
            }
            "cast" => {
                let dtype = dtype_attr(inst)?;
                let mut out = Self::pooled_copy(engine, arg(0)?)?;
                kernels::map_unary(&mut out.data, |x| kernels::cast(x, dtype));
                Ok(out)
            }
            "quantize" | "dequantize" => {
                let mut out = Self::pooled_copy(engine, arg(0)?)?;
                let scales = match inst.attrs.get("scales") {
                    Some(BackendAttr::Floats(s)) => s.as_slice(),
                    _ => bail!("`{}` without scales", inst.name),
                };
                let zero_points = ints_attr(inst, "zero_points")?.unwrap_or(&[]);
                let per_channel = bool_attr(inst, "per_channel")?;
                let channel = match (per_channel, int_attr(inst, "channel_axis")?) {
                    (true, Some(axis)) => Some(kernels::channel_of(&out.dims, axis as usize)),
                    _ => None,
                };
                let params = QuantParams {
                    scales,
                    zero_points,
                    channel,
                };
                if inst.name == "quantize" {
                    kernels::quantize(&mut out.data, &params, dtype_attr(inst)?);
                } else {
                    kernels::dequantize(&mut out.data, &params);
                }
                Ok(out)
            }
            other => bail!("backend op `{other}` cannot be executed"),
        }
    }
}

impl JitFunction for InterpretedModule {
    fn name(&self) -> &str {
        &self.module.name
    }

    fn call_generic(&self, stream: &GraphStream, args: &[GenericVal]) -> Result<()> {
        if !self.generic_wrapper {
            bail!("{} was compiled without a generic wrapper", self.module.name)
        }
        if args.len() != self.module.params.len() {
            bail!(
                "{} takes {} arguments, got {}",
                self.module.name,
                self.module.params.len(),
                args.len()
            )
        }
        let buffers = args
            .iter()
            .map(|a| match a {
                GenericVal::Ptr(b) => Ok(b),
                other => Err(Error::msg(format!("expected a buffer argument, got {other:?}"))),
            })
            .collect::<Result<Vec<_>>>()?;

        let engine = stream.engine();
        let mut slots: Vec<Option<Slot>> = Vec::with_capacity(self.module.slots.len());
        slots.resize_with(self.module.slots.len(), || None);

        let result = (|| -> Result<()> {
            for (param, buf) in self.module.params.iter().zip(&buffers) {
                if param.kind == ParamKind::Input {
                    slots[param.slot] = Some(self.load_param(engine, param, buf)?);
                }
            }
            for inst in &self.module.body {
                let out = self.run(engine, inst, &slots)?;
                let slot = *inst
                    .outputs
                    .first()
                    .with_context(|| format!("`{}` has no outputs", inst.name))?;
                if let Some(old) = slots[slot].replace(out) {
                    engine.recycle_buffer(old.data);
                }
            }
            for (param, buf) in self.module.params.iter().zip(&buffers) {
                if param.kind == ParamKind::Output {
                    let uid = param.unique_id;
                    let slot = slots[param.slot]
                        .as_ref()
                        .with_context(|| format!("output #{uid} was never computed"))?;
                    self.store_param(param, slot, buf)?;
                }
            }
            Ok(())
        })();

        for slot in slots.into_iter().flatten() {
            engine.recycle_buffer(slot.data);
        }
        result
    }
}
