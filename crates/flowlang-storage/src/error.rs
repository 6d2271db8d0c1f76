//! Storage errors.

use thiserror::Error;

/// Errors from the pipeline store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    /// No image under the given name or hash.
    #[error("pipeline not found: {reference}")]
    NotFound { reference: String },
}
