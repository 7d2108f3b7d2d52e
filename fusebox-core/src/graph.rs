use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Graph as PetGraph;
use petgraph::{
    dot::{Config, Dot},
    graph::NodeIndex,
};

use crate::op::Op;
use crate::{Error, LogicalTensor, Result};

/// Index of a value inside its [`OpGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) usize);

impl From<ValueId> for usize {
    fn from(value: ValueId) -> Self {
        value.0
    }
}

/// A directed edge: the logical tensor it carries, its producer and its consumers.
///
/// Producers and consumers are `(op index, port)` pairs into the owning graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub(crate) lt: LogicalTensor,
    pub(crate) producer: Option<(usize, usize)>,
    pub(crate) consumers: Vec<(usize, usize)>,
}

impl Value {
    pub fn logical_tensor(&self) -> &LogicalTensor {
        &self.lt
    }

    pub fn producer(&self) -> Option<(usize, usize)> {
        self.producer
    }

    pub fn consumers(&self) -> &[(usize, usize)] {
        &self.consumers
    }
}

/// An arena of ops and values addressed by index.
///
/// Cloning is the deep copy used to isolate a partition's working state; op ids and
/// logical tensor ids survive the copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpGraph {
    ops: Vec<Op>,
    values: Vec<Value>,
}

impl OpGraph {
    /// Create an empty graph.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, lt: LogicalTensor) -> ValueId {
        self.values.push(Value {
            lt,
            producer: None,
            consumers: Vec::new(),
        });
        ValueId(self.values.len() - 1)
    }

    /// Append `op`, wiring it to existing values. Returns the op's id.
    pub fn add_op(&mut self, mut op: Op, inputs: &[ValueId], outputs: &[ValueId]) -> Result<usize> {
        for v in inputs.iter().chain(outputs) {
            if v.0 >= self.values.len() {
                return Err(Error::InvalidGraph(format!("value {} does not exist", v.0)));
            }
        }
        for v in outputs {
            if let Some((producer, _)) = self.values[v.0].producer {
                return Err(Error::InvalidGraph(format!(
                    "value {} is already produced by op {}",
                    self.values[v.0].lt.id, self.ops[producer].id
                )));
            }
        }

        let idx = self.ops.len();
        op.id = idx;
        op.inputs = inputs.to_vec();
        op.outputs = outputs.to_vec();
        for (port, v) in inputs.iter().enumerate() {
            self.values[v.0].consumers.push((idx, port));
        }
        for (port, v) in outputs.iter().enumerate() {
            self.values[v.0].producer = Some((idx, port));
        }
        self.ops.push(op);
        Ok(idx)
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn op(&self, idx: usize) -> &Op {
        &self.ops[idx]
    }

    pub(crate) fn op_mut(&mut self, idx: usize) -> &mut Op {
        &mut self.ops[idx]
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    pub(crate) fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0]
    }

    /// Find the value carrying the logical tensor `lt_id`.
    pub fn find_value(&self, lt_id: usize) -> Option<ValueId> {
        self.values
            .iter()
            .position(|v| v.lt.id == lt_id)
            .map(ValueId)
    }

    /// Values consumed inside the graph but produced outside of it.
    pub fn input_values(&self) -> Vec<ValueId> {
        (0..self.values.len())
            .filter(|&i| self.values[i].producer.is_none() && !self.values[i].consumers.is_empty())
            .map(ValueId)
            .collect()
    }

    /// Values produced inside the graph that no op in it consumes.
    pub fn output_values(&self) -> Vec<ValueId> {
        (0..self.values.len())
            .filter(|&i| self.values[i].producer.is_some() && self.values[i].consumers.is_empty())
            .map(ValueId)
            .collect()
    }

    /// Op indices ordered so that every op comes after all of its in-graph producers.
    pub fn topo_order(&self) -> Result<Vec<usize>> {
        let mut dep_graph = DiGraphMap::<usize, ()>::new();
        for idx in 0..self.ops.len() {
            dep_graph.add_node(idx);
        }
        for (idx, op) in self.ops.iter().enumerate() {
            for v in &op.inputs {
                if let Some((producer, _)) = self.values[v.0].producer {
                    dep_graph.add_edge(producer, idx, ());
                }
            }
        }
        toposort(&dep_graph, None).map_err(|cycle| {
            Error::InvalidGraph(format!(
                "cycle detected through op {}",
                self.ops[cycle.node_id()].id
            ))
        })
    }

    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let mut g = PetGraph::<String, ()>::new();
        let nodes: Vec<NodeIndex> = self
            .ops
            .iter()
            .map(|op| g.add_node(format!("{}({})", op.kind, op.id)))
            .collect();
        for (idx, op) in self.ops.iter().enumerate() {
            for v in &op.inputs {
                if let Some((producer, _)) = self.values[v.0].producer {
                    g.add_edge(nodes[producer], nodes[idx], ());
                }
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpKind;
    use crate::DataType;

    fn chain() -> (OpGraph, Vec<ValueId>) {
        let mut g = OpGraph::empty();
        let a = g.add_value(LogicalTensor::new(0, [4], DataType::F32));
        let b = g.add_value(LogicalTensor::unknown(1, DataType::F32));
        let c = g.add_value(LogicalTensor::unknown(2, DataType::F32));
        // declared out of order on purpose
        g.add_op(Op::new(OpKind::Sigmoid), &[b], &[c]).unwrap();
        g.add_op(Op::new(OpKind::Relu), &[a], &[b]).unwrap();
        (g, vec![a, b, c])
    }

    #[test]
    fn topo_order_follows_edges_not_declaration() {
        let (g, _) = chain();
        assert_eq!(g.topo_order().unwrap(), vec![1, 0]);
    }

    #[test]
    fn boundary_values() {
        let (g, v) = chain();
        assert_eq!(g.input_values(), vec![v[0]]);
        assert_eq!(g.output_values(), vec![v[2]]);
    }

    #[test]
    fn double_producer_is_rejected() {
        let (mut g, v) = chain();
        let err = g.add_op(Op::new(OpKind::Relu), &[v[0]], &[v[2]]);
        assert!(matches!(err, Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn cycle_is_invalid_graph() {
        let mut g = OpGraph::empty();
        let a = g.add_value(LogicalTensor::unknown(0, DataType::F32));
        let b = g.add_value(LogicalTensor::unknown(1, DataType::F32));
        g.add_op(Op::new(OpKind::Relu), &[a], &[b]).unwrap();
        g.add_op(Op::new(OpKind::Relu), &[b], &[a]).unwrap();
        assert!(matches!(g.topo_order(), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn dot_lists_ops() {
        let (g, _) = chain();
        let dot = g.to_dot();
        assert!(dot.contains("ReLU(1)"));
        assert!(dot.contains("Sigmoid(0)"));
    }
}
