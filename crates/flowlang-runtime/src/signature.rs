//! The DataSignature: a run's result envelope.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowlang_core::dag::NodeId;
use flowlang_core::hash::ContentHash;
use flowlang_core::value::Value;

use crate::error::NodeError;
use crate::suspend::SuspendedExecution;

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Suspended,
    Failed(Vec<NodeFailure>),
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// One node's failure, with its human name for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: NodeId,
    pub name: String,
    pub error: NodeError,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.node, self.name, self.error)
    }
}

/// Per-node execution metadata: final status, latency, optional context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node: NodeId,
    pub name: String,
    pub status: crate::status::ModuleStatus,
    pub latency_ms: Option<u64>,
    pub context: Option<String>,
}

/// The result envelope of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSignature {
    pub execution_id: Uuid,
    pub pipeline_hash: ContentHash,
    pub resumption_count: u32,
    pub status: RunStatus,
    /// Echo of the supplied inputs.
    pub inputs: IndexMap<String, Value>,
    /// Values of intermediate data nodes, when requested in the run
    /// options.
    pub computed: Option<IndexMap<String, Value>>,
    pub outputs: IndexMap<String, Value>,
    pub missing_inputs: Vec<String>,
    pub suspended: Option<SuspendedExecution>,
    pub node_meta: Vec<NodeMeta>,
}

impl DataSignature {
    /// The failures, if the run failed.
    pub fn failures(&self) -> &[NodeFailure] {
        match &self.status {
            RunStatus::Failed(failures) => failures,
            _ => &[],
        }
    }

    /// The recorded status of a node, by its human name.
    pub fn status_of(&self, name: &str) -> Option<&crate::status::ModuleStatus> {
        self.node_meta
            .iter()
            .find(|meta| meta.name == name)
            .map(|meta| &meta.status)
    }
}
