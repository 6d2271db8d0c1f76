//! Runtime error taxonomy.
//!
//! [`NodeError`] is what travels through poisoned cells: every failure a
//! node can observe or cause. Synchronous setup failures (bad inputs,
//! missing modules) use the same kinds but surface as `Err` from the run
//! entry points before any task spawns.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowlang_core::error::CoreError;
use flowlang_core::module::ModuleError;

/// A per-node runtime error.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("module '{name}' is not registered")]
    MissingModule { name: String },

    #[error("required input '{name}' was not provided")]
    MissingInput { name: String },

    #[error("unexpected input '{name}'")]
    UnexpectedInput { name: String },

    #[error("input '{name}': expected {expected}, got {actual}")]
    InputTypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("module failed: {error}")]
    ModuleFailure { error: ModuleError },

    #[error("timed out waiting for inputs after {waited_ms}ms")]
    InputWaitTimeout { waited_ms: u64 },

    #[error("module timed out after {limit_ms}ms")]
    ModuleTimeout { limit_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("circuit open for module '{module}'")]
    CircuitOpen { module: String },

    #[error("throttle wait for module '{module}' was interrupted")]
    ThrottleExceeded { module: String },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<NodeError> },

    #[error("upstream '{upstream}' failed")]
    InputFailure { upstream: String },

    #[error(transparent)]
    Transform(#[from] CoreError),

    #[error("snapshot belongs to pipeline {snapshot}, not {pipeline}")]
    SnapshotMismatch { snapshot: String, pipeline: String },
}

impl NodeError {
    /// Whether a retry may help.
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::ModuleFailure { error } => error.is_transient(),
            NodeError::ModuleTimeout { .. } => true,
            _ => false,
        }
    }
}
