//! Semantic diagnostics with source spans and rich context fields.
//!
//! [`CheckError`] captures enough context to act on every error without
//! re-querying the AST: the names involved, the expected and actual types,
//! and the span. [`CheckWarning`] covers the non-fatal findings (unused
//! bindings, option-consistency issues, the list-merge ambiguity).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowlang_core::types::DataType;
use flowlang_parser::span::{line_col, render_snippet, Span};

/// A semantic error detected during type checking.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CheckError {
    #[error("undefined variable '{name}'")]
    UndefinedVariable { name: String, span: Span },

    #[error("undefined type '{name}'")]
    UndefinedType { name: String, span: Span },

    #[error("undefined function or module '{name}'")]
    UndefinedFunction { name: String, span: Span },

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: DataType,
        actual: DataType,
        span: Span,
    },

    #[error("'{name}' expects {expected} arguments, got {actual}")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
        span: Span,
    },

    #[error("module '{module}' has no parameter '{param}'")]
    UnknownParameter {
        module: String,
        param: String,
        span: Span,
    },

    #[error("unknown field '{field}' (available: {available:?})")]
    InvalidFieldAccess {
        field: String,
        available: Vec<String>,
        span: Span,
    },

    #[error("cannot project field '{field}' (available: {available:?})")]
    InvalidProjection {
        field: String,
        available: Vec<String>,
        span: Span,
    },

    #[error("cannot merge {left} with {right}")]
    IncompatibleMerge {
        left: DataType,
        right: DataType,
        span: Span,
    },

    #[error("match is not exhaustive; uncovered: {uncovered:?}")]
    NonExhaustiveMatch {
        uncovered: Vec<String>,
        span: Span,
    },

    #[error("cannot infer lambda parameter types here; annotate them")]
    AmbiguousLambda { span: Span },

    #[error("'{name}' is already bound")]
    DuplicateBinding { name: String, span: Span },

    #[error("at most one @example annotation is allowed per input")]
    DuplicateExampleAnnotation { span: Span },

    #[error("invalid literal: {message}")]
    InvalidLiteral { message: String, span: Span },

    #[error("invalid option '{key}': {message}")]
    InvalidOption {
        key: String,
        message: String,
        span: Span,
    },
}

impl CheckError {
    pub fn span(&self) -> Span {
        match self {
            CheckError::UndefinedVariable { span, .. }
            | CheckError::UndefinedType { span, .. }
            | CheckError::UndefinedFunction { span, .. }
            | CheckError::TypeMismatch { span, .. }
            | CheckError::ArityMismatch { span, .. }
            | CheckError::UnknownParameter { span, .. }
            | CheckError::InvalidFieldAccess { span, .. }
            | CheckError::InvalidProjection { span, .. }
            | CheckError::IncompatibleMerge { span, .. }
            | CheckError::NonExhaustiveMatch { span, .. }
            | CheckError::AmbiguousLambda { span }
            | CheckError::DuplicateBinding { span, .. }
            | CheckError::DuplicateExampleAnnotation { span }
            | CheckError::InvalidLiteral { span, .. }
            | CheckError::InvalidOption { span, .. } => *span,
        }
    }

    /// Renders the error with line/column and a caret underline.
    pub fn render(&self, source: &str) -> String {
        let span = self.span();
        let (line, col) = line_col(source, span.start);
        format!(
            "error: {self} at line {line}, column {col}\n{}",
            render_snippet(source, span)
        )
    }
}

/// A non-fatal finding. Warnings never fail compilation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CheckWarning {
    #[error("'{name}' is never used")]
    UnusedVariable { name: String, span: Span },

    #[error("'delay' has no effect without 'retry'")]
    DelayWithoutRetry { span: Span },

    #[error("'backoff' has no effect without 'retry'")]
    BackoffWithoutRetry { span: Span },

    #[error("'cache_backend' has no effect without 'cache'")]
    CacheBackendWithoutCache { span: Span },

    #[error("'lazy' has no effect without a conditional consumer")]
    LazyWithoutConditionalConsumer { span: Span },

    #[error("merging a list with a record broadcasts element-wise; \
             project or restructure if record extension was intended")]
    AmbiguousListMerge { span: Span },
}

impl CheckWarning {
    pub fn span(&self) -> Span {
        match self {
            CheckWarning::UnusedVariable { span, .. }
            | CheckWarning::DelayWithoutRetry { span }
            | CheckWarning::BackoffWithoutRetry { span }
            | CheckWarning::CacheBackendWithoutCache { span }
            | CheckWarning::LazyWithoutConditionalConsumer { span }
            | CheckWarning::AmbiguousListMerge { span } => *span,
        }
    }

    pub fn render(&self, source: &str) -> String {
        let span = self.span();
        let (line, col) = line_col(source, span.start);
        format!(
            "warning: {self} at line {line}, column {col}\n{}",
            render_snippet(source, span)
        )
    }
}
