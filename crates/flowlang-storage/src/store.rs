//! The [`PipelineStore`] trait: content-addressed storage of compiled
//! pipeline images with human-readable name aliases.
//!
//! The key is the DAG spec's structural hash, so storing the same compiled
//! pipeline twice is a no-op and stored images are immutable by
//! construction. Aliases are mutable pointers into the content-addressed
//! space; the last writer wins. All backends implement this trait so they
//! are swappable without touching core logic.

use std::sync::Arc;

use flowlang_core::dag::PipelineImage;
use flowlang_core::hash::ContentHash;

use crate::error::StorageError;

/// Reference to a stored pipeline: by alias or by content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRef {
    Name(String),
    Hash(ContentHash),
}

impl StoreRef {
    /// Parses a reference string: a 64-character hex digest is a hash,
    /// anything else an alias.
    pub fn parse(reference: &str) -> StoreRef {
        match ContentHash::from_hex(reference) {
            Some(hash) => StoreRef::Hash(hash),
            None => StoreRef::Name(reference.to_string()),
        }
    }
}

impl std::fmt::Display for StoreRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreRef::Name(name) => write!(f, "{name}"),
            StoreRef::Hash(hash) => write!(f, "{hash}"),
        }
    }
}

/// The storage contract for compiled pipelines.
pub trait PipelineStore: Send + Sync {
    /// Inserts an image if absent; returns its structural hash either way.
    fn store(&self, image: PipelineImage) -> ContentHash;

    /// Binds a name to a hash. Last writer wins. Fails if the hash is not
    /// stored.
    fn alias(&self, name: &str, hash: ContentHash) -> Result<(), StorageError>;

    /// Resolves a reference to its image.
    fn get(&self, reference: &StoreRef) -> Result<Arc<PipelineImage>, StorageError>;

    /// The hash an alias currently points at.
    fn resolve(&self, name: &str) -> Result<ContentHash, StorageError>;

    /// All stored hashes.
    fn list(&self) -> Vec<ContentHash>;
}
