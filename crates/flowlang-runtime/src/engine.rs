//! The Engine: the embedding-facing facade.
//!
//! Owns the module registry, the pipeline store, and the executor with its
//! scheduler/resilience/backend configuration. Everything is explicit
//! owned state injected at construction; tests build fresh engines.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use thiserror::Error;

use flowlang_compile::{CompileFailure, CompileOptions, CompileResult};
use flowlang_core::dag::PipelineImage;
use flowlang_core::error::CoreError;
use flowlang_core::hash::ContentHash;
use flowlang_core::module::{ModuleDescriptor, ModuleRegistry};
use flowlang_core::value::Value;
use flowlang_storage::{InMemoryStore, PipelineStore, StorageError, StoreRef};

use crate::error::NodeError;
use crate::executor::{Executor, RunHandle, RunOptions};
use crate::resilience::{Resilience, ResilienceConfig};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::signature::DataSignature;
use crate::spi::Backends;
use crate::suspend::SuspendedExecution;

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileFailure),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Registry(#[from] CoreError),

    /// A synchronous run failure: bad inputs or a missing module, detected
    /// before any task spawns.
    #[error(transparent)]
    Run(#[from] NodeError),
}

struct EngineState {
    scheduler: SchedulerConfig,
    resilience: ResilienceConfig,
    backends: Backends,
    executor: Executor,
}

impl EngineState {
    fn rebuild(&mut self) {
        self.executor = Executor::new(
            Scheduler::new(self.scheduler),
            Resilience::new(self.resilience),
            self.backends.clone(),
        );
    }
}

/// The flowlang runtime engine.
pub struct Engine {
    registry: RwLock<ModuleRegistry>,
    store: Arc<dyn PipelineStore>,
    state: RwLock<EngineState>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine::with_store(Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn PipelineStore>) -> Engine {
        let scheduler = SchedulerConfig::default();
        let resilience = ResilienceConfig::default();
        let backends = Backends::default();
        let executor = Executor::new(
            Scheduler::new(scheduler),
            Resilience::new(resilience),
            backends.clone(),
        );
        Engine {
            registry: RwLock::new(ModuleRegistry::new()),
            store,
            state: RwLock::new(EngineState {
                scheduler,
                resilience,
                backends,
                executor,
            }),
        }
    }

    // -----------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------

    /// Registers a module; duplicates by identity are rejected.
    pub fn register_module(&self, descriptor: ModuleDescriptor) -> Result<(), CoreError> {
        self.registry.write().register(descriptor)
    }

    pub fn set_scheduler(&self, config: SchedulerConfig) {
        let mut state = self.state.write();
        state.scheduler = config;
        state.rebuild();
    }

    pub fn set_resilience(&self, config: ResilienceConfig) {
        let mut state = self.state.write();
        state.resilience = config;
        state.rebuild();
    }

    pub fn set_backends(&self, backends: Backends) {
        let mut state = self.state.write();
        state.backends = backends;
        state.rebuild();
    }

    // -----------------------------------------------------------------
    // Compilation and storage
    // -----------------------------------------------------------------

    /// Compiles source against the registered module signatures.
    pub fn compile(&self, source: &str, name: &str) -> Result<CompileResult, CompileFailure> {
        self.compile_with(source, name, CompileOptions::default())
    }

    pub fn compile_with(
        &self,
        source: &str,
        name: &str,
        options: CompileOptions,
    ) -> Result<CompileResult, CompileFailure> {
        let registry = self.registry.read();
        flowlang_compile::compile(source, name, &registry, options)
    }

    /// Stores an image content-addressed; returns its hash.
    pub fn store(&self, image: PipelineImage) -> ContentHash {
        self.store.store(image)
    }

    /// Binds a human-readable name to a stored hash.
    pub fn alias(&self, name: &str, hash: ContentHash) -> Result<(), StorageError> {
        self.store.alias(name, hash)
    }

    /// Fetches a stored image by name or hash.
    pub fn get(&self, reference: &StoreRef) -> Result<Arc<PipelineImage>, StorageError> {
        self.store.get(reference)
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Runs a stored pipeline.
    pub async fn run(
        &self,
        reference: &StoreRef,
        inputs: IndexMap<String, Value>,
        options: RunOptions,
    ) -> Result<DataSignature, EngineError> {
        let image = self.store.get(reference)?;
        self.run_image(image, inputs, options).await
    }

    /// Runs an image directly, without the store.
    pub async fn run_image(
        &self,
        image: Arc<PipelineImage>,
        inputs: IndexMap<String, Value>,
        options: RunOptions,
    ) -> Result<DataSignature, EngineError> {
        let executor = self.executor();
        let registry = self.registry_snapshot();
        Ok(executor.run(image, registry, inputs, options).await?)
    }

    /// Starts a cancellable run.
    pub fn run_cancellable(
        &self,
        reference: &StoreRef,
        inputs: IndexMap<String, Value>,
        options: RunOptions,
    ) -> Result<RunHandle, EngineError> {
        let image = self.store.get(reference)?;
        let executor = self.executor();
        let registry = self.registry_snapshot();
        Ok(executor.run_cancellable(image, registry, inputs, options))
    }

    /// Resumes a suspended execution with additional inputs. The image is
    /// found by the snapshot's pipeline hash.
    pub async fn resume(
        &self,
        suspended: SuspendedExecution,
        additional_inputs: IndexMap<String, Value>,
        options: RunOptions,
    ) -> Result<DataSignature, EngineError> {
        let image = self.store.get(&StoreRef::Hash(suspended.pipeline_hash))?;
        let executor = self.executor();
        let registry = self.registry_snapshot();
        Ok(executor
            .resume(image, registry, suspended, additional_inputs, options)
            .await?)
    }

    fn executor(&self) -> Executor {
        self.state.read().executor.clone()
    }

    fn registry_snapshot(&self) -> Arc<ModuleRegistry> {
        Arc::new(self.registry.read().clone())
    }
}
