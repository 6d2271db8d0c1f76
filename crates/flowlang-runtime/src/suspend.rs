//! Suspension snapshots.
//!
//! When a resumable run cannot proceed (required inputs missing), the
//! executor captures every already-resolved cell, the status map, and the
//! pipeline hash. Resumption pre-fills cells from the snapshot and skips
//! nodes that already fired; it is a continuation, not a retry.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use flowlang_core::dag::NodeId;
use flowlang_core::hash::ContentHash;
use flowlang_core::value::Value;

use crate::status::ModuleStatus;

/// A snapshot of a partially completed run plus what is still required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedExecution {
    /// Structural hash of the pipeline this snapshot belongs to.
    pub pipeline_hash: ContentHash,
    /// How many times the execution has been resumed so far.
    pub resumption_count: u32,
    /// Values of every cell that had resolved at suspension time.
    pub completed: Vec<(NodeId, Value)>,
    /// Module statuses at suspension time.
    pub statuses: Vec<(NodeId, ModuleStatus)>,
    /// Inputs supplied so far.
    pub inputs: IndexMap<String, Value>,
    /// Required input names still outstanding.
    pub missing_inputs: Vec<String>,
}

impl SuspendedExecution {
    /// The snapshotted value of a node, if it completed before suspension.
    pub fn value_of(&self, node: NodeId) -> Option<&Value> {
        self.completed
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, value)| value)
    }

    /// Whether the node had already fired when the snapshot was taken.
    pub fn fired(&self, node: NodeId) -> bool {
        self.statuses
            .iter()
            .any(|(id, status)| *id == node && matches!(status, ModuleStatus::Fired { .. }))
    }
}
