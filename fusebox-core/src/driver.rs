//! Optimization and lowering of a backend graph into a schedulable module.

use std::fmt::{self, Display};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::constant_prop::constant_propagation;
use crate::ir::{BackendAttrs, BackendGraph, INPUT_OP, OUTPUT_OP};
use crate::logical_tensor::dense_strides;
use crate::{DataType, Error, Result};

/// Fixed tuning parameters handed to the lowering driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TuningParams {
    pub batch_size: usize,
    pub repeat: usize,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            batch_size: 28,
            repeat: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Input,
    Output,
}

/// One positional parameter of a lowered module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub unique_id: usize,
    /// Value slot the parameter binds to.
    pub slot: usize,
    pub dims: Vec<i64>,
    pub dtype: DataType,
    /// Per-dimension strides of the caller buffer, in elements.
    pub strides: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub name: &'static str,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub attrs: BackendAttrs,
    pub is_constant: bool,
}

/// A linear program over value slots, with parameters in calling-convention order.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredModule {
    pub name: String,
    pub params: Vec<ParamSpec>,
    /// Dims of every value slot.
    pub slots: Vec<Vec<i64>>,
    pub body: Vec<Instruction>,
}

impl LoweredModule {
    pub fn constant_instructions(&self) -> usize {
        self.body.iter().filter(|i| i.is_constant).count()
    }
}

impl Display for LoweredModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for (pos, p) in self.params.iter().enumerate() {
            writeln!(
                f,
                "  param {pos}: {:?} #{} -> %{} {}{:?} strides {:?}",
                p.kind, p.unique_id, p.slot, p.dtype, p.dims, p.strides
            )?;
        }
        for inst in &self.body {
            let outs: Vec<String> = inst.outputs.iter().map(|s| format!("%{s}")).collect();
            let ins: Vec<String> = inst.inputs.iter().map(|s| format!("%{s}")).collect();
            let constant = if inst.is_constant { " const" } else { "" };
            writeln!(
                f,
                "  {} = {}({}){constant} {:?}",
                outs.join(", "),
                inst.name,
                ins.join(", "),
                inst.attrs
            )?;
        }
        Ok(())
    }
}

/// Turns a backend graph into a lowered module.
pub trait LoweringDriver: Send + Sync {
    /// `args` lists the unique ids of the graph's input and output ops in calling order.
    fn lower(
        &self,
        graph: BackendGraph,
        tuning: &TuningParams,
        args: &[usize],
    ) -> Result<LoweredModule>;
}

/// In-crate driver: constant propagation, then a topological schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceDriver;

impl ReferenceDriver {
    pub fn optimize(&self, graph: &mut BackendGraph, tuning: &TuningParams) -> Result<()> {
        graph.check_connection()?;
        let sweeps = constant_propagation(graph)?;
        log::debug!(
            "optimized backend graph ({} ops, {sweeps} propagation sweeps, batch {} x {})",
            graph.ops().len(),
            tuning.batch_size,
            tuning.repeat
        );
        Ok(())
    }

    fn param(graph: &BackendGraph, uid: usize) -> Result<ParamSpec> {
        let (kind, slot) = graph
            .ops()
            .iter()
            .find_map(|op| match op.name {
                INPUT_OP if op.unique_id == uid => Some((ParamKind::Input, op.outputs[0])),
                OUTPUT_OP if op.unique_id == uid => Some((ParamKind::Output, op.inputs[0])),
                _ => None,
            })
            .ok_or_else(|| Error::msg(format!("no boundary op with unique id {uid}")))?;
        let desc = &graph.tensor(slot).desc;
        Ok(ParamSpec {
            kind,
            unique_id: uid,
            slot,
            dims: desc.dims.clone(),
            dtype: desc.dtype,
            strides: desc.dim_strides().unwrap_or_else(|| dense_strides(&desc.dims)),
        })
    }
}

impl LoweringDriver for ReferenceDriver {
    fn lower(
        &self,
        mut graph: BackendGraph,
        tuning: &TuningParams,
        args: &[usize],
    ) -> Result<LoweredModule> {
        self.optimize(&mut graph, tuning)?;

        let params = args
            .iter()
            .map(|uid| Self::param(&graph, *uid))
            .collect::<Result<Vec<_>>>()?;

        let mut body = Vec::new();
        for idx in graph.topo_order()? {
            let op = &graph.ops()[idx];
            if op.name == INPUT_OP || op.name == OUTPUT_OP {
                continue;
            }
            body.push(Instruction {
                name: op.name,
                inputs: op.inputs.clone(),
                outputs: op.outputs.clone(),
                attrs: op.attrs.clone(),
                is_constant: op.is_constant,
            });
        }
        let slots = graph.tensors().iter().map(|t| t.desc.dims.clone()).collect();

        let mut hasher = DefaultHasher::new();
        graph.to_string().hash(&mut hasher);
        args.hash(&mut hasher);
        let name = format!("fused_partition_{}", hasher.finish());

        Ok(LoweredModule {
            name,
            params,
            slots,
            body,
        })
    }
}
