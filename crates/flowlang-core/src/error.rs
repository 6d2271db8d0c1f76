//! Core error types for flowlang-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering the
//! value algebra, module registry, and DAG spec invariants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::NodeId;
use crate::types::DataType;

/// Errors produced by the flowlang-core crate.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum CoreError {
    /// A value did not have the type an operation requires.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Field access on a record that has no such field.
    #[error("unknown field '{field}' (available: {available:?})")]
    InvalidFieldAccess {
        field: String,
        available: Vec<String>,
    },

    /// Projection named a field the record does not carry.
    #[error("cannot project field '{field}' (available: {available:?})")]
    InvalidProjection {
        field: String,
        available: Vec<String>,
    },

    /// `+` applied to operands that cannot merge.
    #[error("cannot merge {left} with {right}")]
    IncompatibleMerge { left: DataType, right: DataType },

    /// A module identity was registered twice.
    #[error("module {name} v{major}.{minor} is already registered")]
    DuplicateModule {
        name: String,
        major: u32,
        minor: u32,
    },

    /// The graph contains a cycle; the offending nodes are listed.
    #[error("dependency cycle involving nodes {nodes:?}")]
    DagCycle { nodes: Vec<NodeId> },

    /// A node id was not found in the DAG spec.
    #[error("node not found: {id}")]
    NodeNotFound { id: NodeId },

    /// A structural invariant of the DAG spec was violated.
    #[error("invalid dag: {reason}")]
    InvariantViolation { reason: String },

    /// Requested the zero value of a type that has none.
    #[error("type {ty} has no zero value")]
    NoZeroValue { ty: DataType },

    /// A match transform saw a value no pattern covers. The checker rules
    /// this out for well-typed pipelines; it can only surface on malformed
    /// hand-built specs.
    #[error("no match arm covers a value of type {actual}")]
    NoMatchingArm { actual: DataType },
}

impl CoreError {
    /// Convenience constructor keeping call sites short.
    pub fn type_mismatch(expected: impl ToString, actual: impl ToString) -> CoreError {
        CoreError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
