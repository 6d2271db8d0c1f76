//! In-memory pipeline store.
//!
//! The default backend: a hash-keyed map plus an alias table behind
//! `parking_lot` read-write locks. Suits embedding and tests; persistent
//! backends implement the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use flowlang_core::dag::PipelineImage;
use flowlang_core::hash::ContentHash;

use crate::error::StorageError;
use crate::store::{PipelineStore, StoreRef};

/// A process-local, thread-safe pipeline store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    images: RwLock<HashMap<ContentHash, Arc<PipelineImage>>>,
    aliases: RwLock<HashMap<String, ContentHash>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStore for InMemoryStore {
    fn store(&self, image: PipelineImage) -> ContentHash {
        let hash = image.hash;
        self.images
            .write()
            .entry(hash)
            .or_insert_with(|| Arc::new(image));
        hash
    }

    fn alias(&self, name: &str, hash: ContentHash) -> Result<(), StorageError> {
        if !self.images.read().contains_key(&hash) {
            return Err(StorageError::NotFound {
                reference: hash.to_string(),
            });
        }
        self.aliases.write().insert(name.to_string(), hash);
        Ok(())
    }

    fn get(&self, reference: &StoreRef) -> Result<Arc<PipelineImage>, StorageError> {
        let hash = match reference {
            StoreRef::Hash(hash) => *hash,
            StoreRef::Name(name) => self.resolve(name)?,
        };
        self.images
            .read()
            .get(&hash)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                reference: reference.to_string(),
            })
    }

    fn resolve(&self, name: &str) -> Result<ContentHash, StorageError> {
        self.aliases
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::NotFound {
                reference: name.to_string(),
            })
    }

    fn list(&self) -> Vec<ContentHash> {
        self.images.read().keys().copied().collect()
    }
}
