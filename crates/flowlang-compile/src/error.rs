//! Compilation errors spanning all phases.

use thiserror::Error;

use flowlang_check::diagnostics::{CheckError, CheckWarning};
use flowlang_core::error::CoreError;
use flowlang_parser::error::ParseError;

/// One compilation error from any phase.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Check(#[from] CheckError),

    /// Lambda bodies are pure; module calls inside them cannot become graph
    /// nodes.
    #[error("module call '{module}' cannot appear inside a lambda body")]
    ModuleCallInLambda { module: String },

    /// A fallback expression may only reference the failing module's own
    /// inputs.
    #[error("fallback references '{name}', which is not an input of the module it guards")]
    FallbackInput { name: String },

    /// A variable reference did not resolve during lowering. The checker
    /// rules this out for whole pipelines; it surfaces for fallback
    /// expressions before being converted to [`CompileError::FallbackInput`].
    #[error("unresolved variable '{name}' during lowering")]
    UnboundVariable { name: String },

    /// Structural failure while building the DAG (cycles, invariant
    /// violations).
    #[error(transparent)]
    Build(#[from] CoreError),
}

/// All errors from a failed compilation, with the warnings gathered before
/// failure.
#[derive(Debug, Clone, Error)]
#[error("compilation failed with {} error(s)", errors.len())]
pub struct CompileFailure {
    pub errors: Vec<CompileError>,
    pub warnings: Vec<CheckWarning>,
}

impl CompileFailure {
    pub fn from_error(error: CompileError) -> Self {
        CompileFailure {
            errors: vec![error],
            warnings: Vec::new(),
        }
    }
}
