//! Pluggable backend surfaces (SPI).
//!
//! Everything the runtime reports to or reads from the outside world goes
//! through a trait object held in [`Backends`]: metrics, tracing spans, the
//! module-result cache, execution events, and suspension storage. Defaults
//! are no-ops plus in-memory cache/suspension backends registered under the
//! name `"memory"`. Tests observe runs through the [`EventLog`] listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use flowlang_core::dag::NodeId;
use flowlang_core::hash::ContentHash;
use flowlang_core::value::Value;

use crate::signature::DataSignature;
use crate::status::ModuleStatus;
use crate::suspend::SuspendedExecution;

// ---------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------

pub trait MetricsProvider: Send + Sync {
    fn counter(&self, name: &str, value: u64);
    fn histogram(&self, name: &str, value: f64);
    fn gauge(&self, name: &str, value: f64);
}

/// Discards every metric.
pub struct NullMetrics;

impl MetricsProvider for NullMetrics {
    fn counter(&self, _name: &str, _value: u64) {}
    fn histogram(&self, _name: &str, _value: f64) {}
    fn gauge(&self, _name: &str, _value: f64) {}
}

// ---------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------

/// A live span; dropping it ends the span.
pub trait SpanGuard: Send {}

pub trait Tracer: Send + Sync {
    fn span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn SpanGuard>;
}

struct NullSpan;
impl SpanGuard for NullSpan {}

/// Emits no spans.
pub struct NullTracer;

impl Tracer for NullTracer {
    fn span(&self, _name: &str, _attributes: &[(&str, String)]) -> Box<dyn SpanGuard> {
        Box::new(NullSpan)
    }
}

// ---------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------

/// Module-result cache keyed by `(module name, content hash of inputs)`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// A live entry and its expiry instant, if present.
    async fn get(&self, key: &ContentHash) -> Option<(Value, Instant)>;
    async fn put(&self, key: ContentHash, value: Value, ttl: Duration);
}

/// In-memory TTL cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<ContentHash, (Value, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &ContentHash) -> Option<(Value, Instant)> {
        let entry = self.entries.get(key)?;
        let (value, expires_at) = entry.value().clone();
        drop(entry);
        if expires_at <= Instant::now() {
            self.entries.remove(key);
            return None;
        }
        Some((value, expires_at))
    }

    async fn put(&self, key: ContentHash, value: Value, ttl: Duration) {
        self.entries.insert(key, (value, Instant::now() + ttl));
    }
}

// ---------------------------------------------------------------------
// Execution events
// ---------------------------------------------------------------------

/// Observable execution milestones.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    NodeStarted {
        node: NodeId,
        name: String,
    },
    NodeCompleted {
        node: NodeId,
        name: String,
        status: ModuleStatus,
    },
    RunCompleted {
        signature: DataSignature,
    },
}

pub trait ExecutionListener: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Ignores every event.
pub struct NullListener;

impl ExecutionListener for NullListener {
    fn on_event(&self, _event: &ExecutionEvent) {}
}

/// Thread-safe, append-only event recorder for tests and debugging.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<RwLock<Vec<ExecutionEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.read().clone()
    }

    /// Node names in the order their `NodeStarted` events arrived.
    pub fn started_order(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::NodeStarted { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Completion events for one node name.
    pub fn completions_of(&self, name: &str) -> Vec<ModuleStatus> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::NodeCompleted {
                    name: event_name,
                    status,
                    ..
                } if event_name == name => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    /// Index of the first event matching the predicate.
    pub fn position(&self, predicate: impl Fn(&ExecutionEvent) -> bool) -> Option<usize> {
        self.events.read().iter().position(predicate)
    }
}

impl ExecutionListener for EventLog {
    fn on_event(&self, event: &ExecutionEvent) {
        self.events.write().push(event.clone());
    }
}

// ---------------------------------------------------------------------
// Suspension storage
// ---------------------------------------------------------------------

pub trait SuspensionStore: Send + Sync {
    /// Persists a snapshot; returns a handle to load it back.
    fn save(&self, suspended: &SuspendedExecution) -> String;
    fn load(&self, handle: &str) -> Option<SuspendedExecution>;
}

/// In-memory suspension store with sequential handles.
#[derive(Default)]
pub struct MemorySuspensionStore {
    entries: DashMap<String, SuspendedExecution>,
    next: AtomicU64,
}

impl MemorySuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SuspensionStore for MemorySuspensionStore {
    fn save(&self, suspended: &SuspendedExecution) -> String {
        let handle = format!("suspension-{}", self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(handle.clone(), suspended.clone());
        handle
    }

    fn load(&self, handle: &str) -> Option<SuspendedExecution> {
        self.entries.get(handle).map(|entry| entry.value().clone())
    }
}

// ---------------------------------------------------------------------
// The bundle
// ---------------------------------------------------------------------

/// Every backend the runtime consults, dependency-injected and swappable.
#[derive(Clone)]
pub struct Backends {
    pub metrics: Arc<dyn MetricsProvider>,
    pub tracer: Arc<dyn Tracer>,
    /// Cache backends by name; `cache_backend: "x"` selects one.
    pub caches: HashMap<String, Arc<dyn CacheBackend>>,
    pub listener: Arc<dyn ExecutionListener>,
    pub suspension: Arc<dyn SuspensionStore>,
}

impl Default for Backends {
    fn default() -> Self {
        let mut caches: HashMap<String, Arc<dyn CacheBackend>> = HashMap::new();
        caches.insert("memory".to_string(), Arc::new(MemoryCache::new()));
        Backends {
            metrics: Arc::new(NullMetrics),
            tracer: Arc::new(NullTracer),
            caches,
            listener: Arc::new(NullListener),
            suspension: Arc::new(MemorySuspensionStore::new()),
        }
    }
}

impl Backends {
    /// The cache selected by a node config, defaulting to `"memory"`.
    pub fn cache(&self, name: Option<&str>) -> Option<Arc<dyn CacheBackend>> {
        self.caches.get(name.unwrap_or("memory")).cloned()
    }

    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listener = listener;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_honors_ttl() {
        let cache = MemoryCache::new();
        let key = flowlang_core::hash::hash_value(&Value::Int(1));
        cache
            .put(key, Value::Int(10), Duration::from_millis(20))
            .await;
        assert!(cache.get(&key).await.is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key).await.is_none(), "expired entry must drop");
    }

    #[test]
    fn suspension_store_roundtrip() {
        let store = MemorySuspensionStore::new();
        let snapshot = SuspendedExecution {
            pipeline_hash: flowlang_core::hash::hash_value(&Value::Int(1)),
            resumption_count: 0,
            completed: vec![],
            statuses: vec![],
            inputs: Default::default(),
            missing_inputs: vec!["x".into()],
        };
        let handle = store.save(&snapshot);
        assert_eq!(store.load(&handle), Some(snapshot));
        assert_eq!(store.load("unknown"), None);
    }
}
