//! Per-module status tracking.
//!
//! Statuses move `Unfired → Running → {Fired | Timed | Failed}` and never
//! leave a terminal state. Each task only writes its own node's entry; the
//! map is shared for observation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use flowlang_core::dag::NodeId;

use crate::error::NodeError;

/// Lifecycle of one module node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum ModuleStatus {
    /// Not yet started (also the final state of a gated-off module).
    #[default]
    Unfired,
    /// Inputs arrived; the module is executing.
    Running,
    /// Completed successfully.
    Fired {
        latency_ms: u64,
        context: Option<String>,
    },
    /// A timeout fired, either waiting for inputs or mid-execution.
    Timed { latency_ms: u64 },
    Failed { error: NodeError },
}

impl ModuleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModuleStatus::Fired { .. } | ModuleStatus::Timed { .. } | ModuleStatus::Failed { .. }
        )
    }

    fn may_become(&self, next: &ModuleStatus) -> bool {
        match self {
            ModuleStatus::Unfired => true,
            ModuleStatus::Running => !matches!(next, ModuleStatus::Unfired),
            _ => false,
        }
    }
}

/// Append-only status map for one run.
#[derive(Debug, Default)]
pub struct StatusMap {
    statuses: DashMap<NodeId, ModuleStatus>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transition. Illegal transitions are a runtime bug.
    pub fn set(&self, node: NodeId, status: ModuleStatus) {
        let previous = self.get(node);
        debug_assert!(
            previous.may_become(&status),
            "illegal status transition for {node}: {previous:?} -> {status:?}"
        );
        self.statuses.insert(node, status);
    }

    pub fn get(&self, node: NodeId) -> ModuleStatus {
        self.statuses
            .get(&node)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn seed(&self, node: NodeId, status: ModuleStatus) {
        self.statuses.insert(node, status);
    }

    pub fn snapshot(&self) -> Vec<(NodeId, ModuleStatus)> {
        let mut entries: Vec<(NodeId, ModuleStatus)> = self
            .statuses
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(node, _)| *node);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unfired() {
        let map = StatusMap::new();
        assert_eq!(map.get(NodeId(0)), ModuleStatus::Unfired);
    }

    #[test]
    fn normal_lifecycle() {
        let map = StatusMap::new();
        let node = NodeId(1);
        map.set(node, ModuleStatus::Running);
        map.set(
            node,
            ModuleStatus::Fired {
                latency_ms: 3,
                context: None,
            },
        );
        assert!(map.get(node).is_terminal());
    }

    #[test]
    #[should_panic(expected = "illegal status transition")]
    fn terminal_states_are_final() {
        let map = StatusMap::new();
        let node = NodeId(1);
        map.set(
            node,
            ModuleStatus::Failed {
                error: NodeError::Cancelled,
            },
        );
        map.set(node, ModuleStatus::Running);
    }

    #[test]
    fn snapshot_is_sorted_by_node() {
        let map = StatusMap::new();
        map.set(NodeId(3), ModuleStatus::Running);
        map.set(NodeId(1), ModuleStatus::Running);
        let nodes: Vec<NodeId> = map.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(nodes, vec![NodeId(1), NodeId(3)]);
    }
}
