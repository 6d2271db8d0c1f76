//! Module descriptors and the process-wide registry.
//!
//! A module is the user-supplied unit of work a pipeline invokes: identified
//! by `(name, major, minor)`, described by an ordered consumes/produces
//! signature, and backed by either a pure function or an effectful
//! suspendable computation. The registry owns descriptors for the process
//! lifetime; descriptors are immutable after registration and compiled
//! pipelines reference them by name only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CoreError;
use crate::types::DataType;
use crate::value::Value;

/// Case-sensitive module identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleIdentity {
    pub name: String,
    pub major: u32,
    pub minor: u32,
}

impl ModuleIdentity {
    pub fn new(name: impl Into<String>, major: u32, minor: u32) -> Self {
        ModuleIdentity {
            name: name.into(),
            major,
            minor,
        }
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{}", self.name, self.major, self.minor)
    }
}

/// Ordered consumes/produces schema. Parameter order matters for positional
/// argument matching at call sites; the ABI boundary matches by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSignature {
    pub consumes: IndexMap<String, DataType>,
    pub produces: IndexMap<String, DataType>,
}

impl ModuleSignature {
    pub fn new<I, O, S, T>(consumes: I, produces: O) -> Self
    where
        I: IntoIterator<Item = (S, DataType)>,
        O: IntoIterator<Item = (T, DataType)>,
        S: Into<String>,
        T: Into<String>,
    {
        ModuleSignature {
            consumes: consumes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            produces: produces.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// The produced record type as a whole.
    pub fn output_type(&self) -> DataType {
        DataType::Record(self.produces.clone())
    }
}

/// Per-module execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Budget for the await-inputs phase.
    pub inputs_timeout: Duration,
    /// Budget for one execution attempt.
    pub module_timeout: Duration,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            inputs_timeout: Duration::from_secs(30),
            module_timeout: Duration::from_secs(60),
        }
    }
}

/// Failure of a module invocation. Transient errors are eligible for retry;
/// fatal errors are not.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ModuleError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl ModuleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModuleError::Transient(_))
    }
}

/// A runnable module implementation.
///
/// The input is always a record value keyed by the signature's consume
/// names; the output must be a record keyed by the produce names.
/// Implementations may perform I/O and should treat future cancellation as
/// fatal.
#[async_trait]
pub trait ModuleImpl: Send + Sync {
    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError>;
}

/// Adapter giving pure functions the [`ModuleImpl`] interface.
struct PureModule<F>(F);

#[async_trait]
impl<F> ModuleImpl for PureModule<F>
where
    F: Fn(Value) -> Result<Value, ModuleError> + Send + Sync,
{
    async fn invoke(&self, inputs: Value) -> Result<Value, ModuleError> {
        (self.0)(inputs)
    }
}

/// Whether a module is a total pure function or may perform I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    Pure,
    Effectful,
}

/// An immutable module descriptor: identity, schema, limits, implementation.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub identity: ModuleIdentity,
    pub signature: ModuleSignature,
    pub config: ModuleConfig,
    pub kind: ModuleKind,
    pub implementation: Arc<dyn ModuleImpl>,
}

impl ModuleDescriptor {
    /// Descriptor for a pure module.
    pub fn pure<F>(identity: ModuleIdentity, signature: ModuleSignature, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, ModuleError> + Send + Sync + 'static,
    {
        ModuleDescriptor {
            identity,
            signature,
            config: ModuleConfig::default(),
            kind: ModuleKind::Pure,
            implementation: Arc::new(PureModule(f)),
        }
    }

    /// Descriptor for an effectful module.
    pub fn effectful(
        identity: ModuleIdentity,
        signature: ModuleSignature,
        implementation: Arc<dyn ModuleImpl>,
    ) -> Self {
        ModuleDescriptor {
            identity,
            signature,
            config: ModuleConfig::default(),
            kind: ModuleKind::Effectful,
            implementation,
        }
    }

    pub fn with_config(mut self, config: ModuleConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("identity", &self.identity)
            .field("signature", &self.signature)
            .field("config", &self.config)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Process-wide mapping from module identity to descriptor.
///
/// Populated during initialization, read-only during runs. Owned and passed
/// into constructors rather than global; cloning shares the descriptors.
#[derive(Debug, Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<ModuleIdentity, Arc<ModuleDescriptor>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor; a duplicate identity is rejected.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<(), CoreError> {
        let identity = descriptor.identity.clone();
        if self.modules.contains_key(&identity) {
            return Err(CoreError::DuplicateModule {
                name: identity.name,
                major: identity.major,
                minor: identity.minor,
            });
        }
        self.modules.insert(identity, Arc::new(descriptor));
        Ok(())
    }

    /// Resolves a name to the highest-versioned descriptor, optionally
    /// constrained to a minimum version.
    pub fn resolve(
        &self,
        name: &str,
        min_version: Option<(u32, u32)>,
    ) -> Option<Arc<ModuleDescriptor>> {
        self.modules
            .iter()
            .filter(|(id, _)| id.name == name)
            .filter(|(id, _)| match min_version {
                Some((major, minor)) => (id.major, id.minor) >= (major, minor),
                None => true,
            })
            .max_by_key(|(id, _)| (id.major, id.minor))
            .map(|(_, desc)| Arc::clone(desc))
    }

    /// The signature for a name, if any version is registered.
    pub fn signature(&self, name: &str) -> Option<&ModuleSignature> {
        self.modules
            .iter()
            .filter(|(id, _)| id.name == name)
            .max_by_key(|(id, _)| (id.major, id.minor))
            .map(|(_, desc)| &desc.signature)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uppercase() -> ModuleDescriptor {
        ModuleDescriptor::pure(
            ModuleIdentity::new("Uppercase", 1, 0),
            ModuleSignature::new(
                [("text", DataType::String)],
                [("result", DataType::String)],
            ),
            |inputs| {
                let text = inputs
                    .access("text")
                    .map_err(|e| ModuleError::Fatal(e.to_string()))?;
                match text {
                    Value::String(s) => Ok(Value::record([("result", Value::String(s.to_uppercase()))])),
                    other => Err(ModuleError::Fatal(format!(
                        "expected String, got {}",
                        other.kind_name()
                    ))),
                }
            },
        )
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = ModuleRegistry::new();
        registry.register(uppercase()).unwrap();
        let desc = registry.resolve("Uppercase", None).unwrap();
        assert_eq!(desc.identity, ModuleIdentity::new("Uppercase", 1, 0));
        assert!(registry.resolve("Missing", None).is_none());
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut registry = ModuleRegistry::new();
        registry.register(uppercase()).unwrap();
        let err = registry.register(uppercase()).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateModule { .. }));
    }

    #[test]
    fn resolve_prefers_highest_version() {
        let mut registry = ModuleRegistry::new();
        let mut v1 = uppercase();
        v1.identity = ModuleIdentity::new("Uppercase", 1, 2);
        let mut v2 = uppercase();
        v2.identity = ModuleIdentity::new("Uppercase", 2, 0);
        registry.register(uppercase()).unwrap();
        registry.register(v1).unwrap();
        registry.register(v2).unwrap();

        let best = registry.resolve("Uppercase", None).unwrap();
        assert_eq!((best.identity.major, best.identity.minor), (2, 0));

        let pinned = registry.resolve("Uppercase", Some((1, 1))).unwrap();
        assert!((pinned.identity.major, pinned.identity.minor) >= (1, 1));

        assert!(registry.resolve("Uppercase", Some((3, 0))).is_none());
    }

    #[test]
    fn name_matching_is_case_sensitive() {
        let mut registry = ModuleRegistry::new();
        registry.register(uppercase()).unwrap();
        assert!(registry.resolve("uppercase", None).is_none());
    }

    #[tokio::test]
    async fn pure_module_invokes() {
        let desc = uppercase();
        let out = desc
            .implementation
            .invoke(Value::record([("text", Value::String("hello".into()))]))
            .await
            .unwrap();
        assert_eq!(
            out,
            Value::record([("result", Value::String("HELLO".into()))])
        );
    }
}
