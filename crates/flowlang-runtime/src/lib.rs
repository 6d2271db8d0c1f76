pub mod cell;
pub mod engine;
pub mod error;
pub mod executor;
pub mod resilience;
pub mod scheduler;
pub mod signature;
pub mod spi;
pub mod status;
pub mod suspend;

// Re-export commonly used types
pub use cell::{CellReader, Completable};
pub use engine::{Engine, EngineError};
pub use error::NodeError;
pub use executor::{Executor, RunHandle, RunOptions};
pub use resilience::{Resilience, ResilienceConfig};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use signature::{DataSignature, NodeFailure, NodeMeta, RunStatus};
pub use spi::{
    Backends, CacheBackend, EventLog, ExecutionEvent, ExecutionListener, MemoryCache,
    MemorySuspensionStore, MetricsProvider, NullListener, NullMetrics, NullTracer, SpanGuard,
    SuspensionStore, Tracer,
};
pub use status::{ModuleStatus, StatusMap};
pub use suspend::SuspendedExecution;
