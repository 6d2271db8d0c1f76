//! Parse errors.

use thiserror::Error;

use crate::span::{line_col, render_snippet, Span};

/// A syntactic error with the span it occurred at. No partial ASTs are
/// produced alongside one.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("parse error at {span}: {message}")]
pub struct ParseError {
    pub span: Span,
    pub message: String,
}

impl ParseError {
    pub fn new(span: Span, message: impl Into<String>) -> ParseError {
        ParseError {
            span,
            message: message.into(),
        }
    }

    /// Renders the error with line/column and a caret underline.
    pub fn render(&self, source: &str) -> String {
        let (line, col) = line_col(source, self.span.start);
        format!(
            "error: {} at line {line}, column {col}\n{}",
            self.message,
            render_snippet(source, self.span)
        )
    }
}
