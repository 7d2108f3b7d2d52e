//! Backend graph IR produced by translation and consumed by the lowering driver.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::constant_prop::PropagationGraph;
use crate::{DataType, Error, Result};

pub const INPUT_OP: &str = "input";
pub const OUTPUT_OP: &str = "output";

/// Backend op names that may carry a trailing scratchpad output.
const SCRATCHPAD_OPS: [&str; 2] = ["matmul", "reorder"];

/// Dense blocking of a tensor: `Blocking(p)` lists original dim indices from the largest
/// stride to the smallest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    #[default]
    Any,
    Blocking(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub dims: Vec<i64>,
    pub dtype: DataType,
    pub format: DataFormat,
    /// Strides sorted in descending order; empty when the format is `Any`.
    pub strides: Vec<i64>,
}

impl TensorDesc {
    pub fn is_any(&self) -> bool {
        self.format == DataFormat::Any
    }

    /// Per-dimension strides rebuilt from the blocking, or `None` for an unresolved format.
    pub fn dim_strides(&self) -> Option<Vec<i64>> {
        let DataFormat::Blocking(perm) = &self.format else {
            return None;
        };
        let mut strides = vec![0; self.dims.len()];
        for (stride, &dim) in self.strides.iter().zip(perm) {
            strides[dim] = *stride;
        }
        Some(strides)
    }
}

/// Backend attribute value. Integers are 32-bit except where a list is passed through verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendAttr {
    Int(i32),
    Ints(Vec<i32>),
    Longs(Vec<i64>),
    Float(f32),
    Floats(Vec<f32>),
    Str(String),
    Bool(bool),
    DataType(DataType),
}

pub type BackendAttrs = BTreeMap<String, BackendAttr>;

#[derive(Debug, Clone, PartialEq)]
pub struct BackendOp {
    pub name: &'static str,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub attrs: BackendAttrs,
    /// Sequential id assigned during translation.
    pub unique_id: usize,
    pub is_constant: bool,
}

impl BackendOp {
    pub fn attr(&self, name: &str) -> Option<&BackendAttr> {
        self.attrs.get(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendTensor {
    pub desc: TensorDesc,
    pub producer: Option<(usize, usize)>,
    pub uses: Vec<(usize, usize)>,
    pub constant: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendGraph {
    pub(crate) ops: Vec<BackendOp>,
    pub(crate) tensors: Vec<BackendTensor>,
}

impl BackendGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[BackendOp] {
        &self.ops
    }

    pub fn tensors(&self) -> &[BackendTensor] {
        &self.tensors
    }

    pub fn tensor(&self, idx: usize) -> &BackendTensor {
        &self.tensors[idx]
    }

    pub fn add_tensor(&mut self, desc: TensorDesc) -> usize {
        self.tensors.push(BackendTensor {
            desc,
            producer: None,
            uses: Vec::new(),
            constant: false,
        });
        self.tensors.len() - 1
    }

    /// Append an op over existing tensors and wire producer/use links.
    pub fn make(
        &mut self,
        name: &'static str,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
        attrs: BackendAttrs,
        unique_id: usize,
    ) -> usize {
        let idx = self.ops.len();
        for (port, t) in inputs.iter().enumerate() {
            self.tensors[*t].uses.push((idx, port));
        }
        for (port, t) in outputs.iter().enumerate() {
            self.tensors[*t].producer = Some((idx, port));
        }
        self.ops.push(BackendOp {
            name,
            inputs,
            outputs,
            attrs,
            unique_id,
            is_constant: false,
        });
        idx
    }

    pub fn make_input(&mut self, desc: TensorDesc, attrs: BackendAttrs, unique_id: usize) -> usize {
        let t = self.add_tensor(desc);
        self.make(INPUT_OP, vec![], vec![t], attrs, unique_id)
    }

    pub fn make_output(&mut self, tensor: usize, attrs: BackendAttrs, unique_id: usize) -> usize {
        self.make(OUTPUT_OP, vec![tensor], vec![], attrs, unique_id)
    }

    pub fn input_ops(&self) -> impl Iterator<Item = (usize, &BackendOp)> {
        self.ops.iter().enumerate().filter(|(_, op)| op.name == INPUT_OP)
    }

    pub fn output_ops(&self) -> impl Iterator<Item = (usize, &BackendOp)> {
        self.ops.iter().enumerate().filter(|(_, op)| op.name == OUTPUT_OP)
    }

    /// Every consumed tensor has a producer, every link points inside the graph, and at
    /// least one output op exists.
    pub fn check_connection(&self) -> Result<()> {
        for (idx, op) in self.ops.iter().enumerate() {
            for (port, &t) in op.inputs.iter().enumerate() {
                let tensor = self.tensors.get(t).ok_or_else(|| {
                    Error::InvalidGraph(format!("op {idx} reads missing tensor {t}"))
                })?;
                if tensor.producer.is_none() {
                    return Err(Error::InvalidGraph(format!(
                        "input {port} of `{}` (op {idx}) has no producer",
                        op.name
                    )));
                }
            }
            for &t in &op.outputs {
                if self.tensors.get(t).and_then(|t| t.producer).map(|(p, _)| p) != Some(idx) {
                    return Err(Error::InvalidGraph(format!(
                        "tensor {t} is not linked back to its producer op {idx}"
                    )));
                }
            }
        }
        if self.output_ops().next().is_none() {
            return Err(Error::InvalidGraph("graph has no outputs".to_string()));
        }
        Ok(())
    }

    /// Op indices with every producer before its users.
    pub fn topo_order(&self) -> Result<Vec<usize>> {
        let mut dep_graph = DiGraphMap::<usize, ()>::new();
        for idx in 0..self.ops.len() {
            dep_graph.add_node(idx);
        }
        for (idx, op) in self.ops.iter().enumerate() {
            for &t in &op.inputs {
                if let Some((producer, _)) = self.tensors[t].producer {
                    dep_graph.add_edge(producer, idx, ());
                }
            }
        }
        toposort(&dep_graph, None)
            .map_err(|cycle| Error::InvalidGraph(format!("cycle through op {}", cycle.node_id())))
    }
}

impl PropagationGraph for BackendGraph {
    fn topo_order(&self) -> Result<Vec<usize>> {
        BackendGraph::topo_order(self)
    }

    fn op_inputs(&self, op: usize) -> Vec<usize> {
        self.ops[op].inputs.clone()
    }

    fn op_outputs(&self, op: usize) -> Vec<usize> {
        self.ops[op].outputs.clone()
    }

    fn scratchpad_outputs(&self, op: usize) -> usize {
        let op = &self.ops[op];
        usize::from(SCRATCHPAD_OPS.contains(&op.name) && op.outputs.len() > 1)
    }

    fn is_constant(&self, value: usize) -> bool {
        self.tensors[value].constant
    }

    fn set_constant(&mut self, value: usize) {
        self.tensors[value].constant = true;
    }

    fn set_op_constant(&mut self, op: usize, is_constant: bool) {
        self.ops[op].is_constant = is_constant;
    }
}

impl Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.dims)?;
        match &self.format {
            DataFormat::Any => write!(f, "@any"),
            DataFormat::Blocking(perm) => write!(f, "@{perm:?}/{:?}", self.strides),
        }
    }
}

impl Display for BackendGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, op) in self.ops.iter().enumerate() {
            let ins: Vec<String> = op.inputs.iter().map(|t| format!("%{t}")).collect();
            let outs: Vec<String> = op
                .outputs
                .iter()
                .map(|t| format!("%{t}: {}", self.tensors[*t].desc))
                .collect();
            writeln!(
                f,
                "op{idx} #{} [{}] = {}({}) {:?}",
                op.unique_id,
                outs.join(", "),
                op.name,
                ins.join(", "),
                op.attrs
            )?;
        }
        Ok(())
    }
}
