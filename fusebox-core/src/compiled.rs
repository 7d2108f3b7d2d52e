use std::sync::Arc;

use crate::engine::{Allocator, EngineLease, GraphEngine};
use crate::jit::{GenericVal, GraphStream, JitFunction};
use crate::tensor::{Stream, Tensor};
use crate::{LogicalTensor, Result};

/// A partition compiled for one device engine.
///
/// Holds a counted reference to the shared engine for its whole lifetime. Dropping it clears the
/// entry point and then gives the engine reference back, which evicts the engine if this was
/// the last partition using it.
#[derive(Debug)]
pub struct CompiledPartition {
    inputs: Vec<LogicalTensor>,
    outputs: Vec<LogicalTensor>,
    entry: Option<Arc<dyn JitFunction>>,
    lease: EngineLease,
}

impl CompiledPartition {
    pub(crate) fn new(
        inputs: Vec<LogicalTensor>,
        outputs: Vec<LogicalTensor>,
        entry: Arc<dyn JitFunction>,
        lease: EngineLease,
    ) -> Self {
        Self {
            inputs,
            outputs,
            entry: Some(entry),
            lease,
        }
    }

    pub fn inputs(&self) -> &[LogicalTensor] {
        &self.inputs
    }

    /// Output tensors as inferred at compile time.
    pub fn outputs(&self) -> &[LogicalTensor] {
        &self.outputs
    }

    /// The compiled output matching logical tensor `id`.
    pub fn output(&self, id: usize) -> Option<&LogicalTensor> {
        self.outputs.iter().find(|t| t.id == id)
    }

    pub fn engine(&self) -> &Arc<GraphEngine> {
        self.lease.engine()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        self.lease.allocator()
    }

    pub fn entry_name(&self) -> Option<&str> {
        self.entry.as_deref().map(JitFunction::name)
    }

    /// Run the entry point. Buffers are passed outputs first, then inputs, each in the order
    /// given at compile time; they are assumed to match the compiled shapes and types.
    pub fn execute(&self, stream: &Stream, inputs: &[Tensor], outputs: &[Tensor]) -> Result<()> {
        let Some(entry) = &self.entry else {
            crate::bail!("compiled partition has no entry point")
        };
        let stream = GraphStream::new(stream, self.lease.engine().clone());
        let args: Vec<GenericVal> = outputs.iter().chain(inputs).map(GenericVal::from).collect();
        entry.call_generic(&stream, &args)
    }
}

impl Drop for CompiledPartition {
    fn drop(&mut self) {
        self.entry = None;
    }
}
