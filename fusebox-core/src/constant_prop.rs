//! Bidirectional constant propagation.
//!
//! Which edges a framework marks constant is not known in advance: it may be partition inputs
//! or edges deep inside the partition. Constant-ness therefore flows both ways: an op whose
//! inputs are all constant makes its outputs constant, and an op whose outputs are all constant
//! makes its inputs constant.

use crate::op::OpKind;
use crate::{OpGraph, Property, Result};

/// A graph the propagation pass can run over.
pub trait PropagationGraph {
    /// Op indices in topological order.
    fn topo_order(&self) -> Result<Vec<usize>>;

    /// Value indices consumed by op `op`.
    fn op_inputs(&self, op: usize) -> Vec<usize>;

    /// Value indices produced by op `op`, scratchpad included.
    fn op_outputs(&self, op: usize) -> Vec<usize>;

    /// Number of trailing outputs of `op` that are backend-private workspace.
    fn scratchpad_outputs(&self, op: usize) -> usize;

    fn is_constant(&self, value: usize) -> bool;

    fn set_constant(&mut self, value: usize);

    fn set_op_constant(&mut self, op: usize, is_constant: bool);
}

/// Run propagation to a fixed point. Returns the number of sweeps that changed something.
///
/// Flags only ever go from non-constant to constant, so this terminates after at most one
/// sweep per op.
pub fn constant_propagation<G: PropagationGraph>(graph: &mut G) -> Result<usize> {
    let order = graph.topo_order()?;
    let mut sweeps = 0;
    loop {
        let mut changed = false;
        for &op in &order {
            let inputs = graph.op_inputs(op);
            let mut outputs = graph.op_outputs(op);
            let scratchpads = graph.scratchpad_outputs(op).min(outputs.len());
            outputs.truncate(outputs.len() - scratchpads);

            // boundary ops have an empty side, which never counts as constant
            let all_inputs_constant =
                !inputs.is_empty() && inputs.iter().all(|v| graph.is_constant(*v));
            let all_outputs_constant =
                !outputs.is_empty() && outputs.iter().all(|v| graph.is_constant(*v));
            graph.set_op_constant(op, all_inputs_constant || all_outputs_constant);

            let targets = if all_inputs_constant {
                outputs
            } else if all_outputs_constant {
                inputs
            } else {
                continue;
            };
            for v in targets {
                if !graph.is_constant(v) {
                    graph.set_constant(v);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
        sweeps += 1;
    }
    log::debug!("constant propagation converged after {sweeps} changing sweeps");
    Ok(sweeps)
}

/// Scratchpad outputs present on an op of `kind` with `num_outputs` outputs.
pub fn scratchpad_count(kind: OpKind, num_outputs: usize) -> usize {
    if kind.has_scratchpad() && num_outputs > kind.num_real_outputs() {
        1
    } else {
        0
    }
}

impl PropagationGraph for OpGraph {
    fn topo_order(&self) -> Result<Vec<usize>> {
        OpGraph::topo_order(self)
    }

    fn op_inputs(&self, op: usize) -> Vec<usize> {
        self.op(op).inputs().iter().map(|v| v.0).collect()
    }

    fn op_outputs(&self, op: usize) -> Vec<usize> {
        self.op(op).outputs().iter().map(|v| v.0).collect()
    }

    fn scratchpad_outputs(&self, op: usize) -> usize {
        let op = self.op(op);
        scratchpad_count(op.kind(), op.outputs().len())
    }

    fn is_constant(&self, value: usize) -> bool {
        self.values()[value].logical_tensor().is_constant()
    }

    fn set_constant(&mut self, value: usize) {
        self.value_mut(crate::ValueId(value)).lt.property = Property::Constant;
    }

    fn set_op_constant(&mut self, op: usize, is_constant: bool) {
        self.op_mut(op).is_constant = is_constant;
    }
}
