//! The parallel DAG executor.
//!
//! One Completable cell per data node, one tokio task per module node and
//! per inline-transform node. Tasks await their input cells, run under the
//! per-node timeouts and the resilience policy stack, then fill (or poison)
//! their output cells. Failure propagates transitively through poisoned
//! cells; unrelated branches finish. Cancellation is cooperative through a
//! [`CancellationToken`] observed at every suspension point.
//!
//! Transform tasks await selectively: the untaken arm of a conditional,
//! branch, guard, match, or short-circuit boolean is never awaited, so a
//! gated-off module stays `Unfired` and failures in untaken arms cannot
//! poison the result. A match awaits its scrutinee, dispatches, then awaits
//! only the captures the taken arm's body reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use flowlang_core::dag::{DagSpec, DataRole, NodeId, OnError, PipelineImage, TransformSpec};
use flowlang_core::hash::hash_named_inputs;
use flowlang_core::module::{ModuleDescriptor, ModuleRegistry, ModuleSignature};
use flowlang_core::transform::Transform;
use flowlang_core::types::DataType;
use flowlang_core::value::Value;

use crate::cell::Completable;
use crate::error::NodeError;
use crate::resilience::Resilience;
use crate::scheduler::Scheduler;
use crate::signature::{DataSignature, NodeFailure, NodeMeta, RunStatus};
use crate::spi::{Backends, ExecutionEvent};
use crate::status::{ModuleStatus, StatusMap};
use crate::suspend::SuspendedExecution;

/// Per-run knobs.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Include intermediate data-node values in the signature.
    pub computed_values: bool,
    /// Wall-clock budget for the whole run; expiry cancels it.
    pub run_timeout: Option<Duration>,
    /// Stop waiting for remaining outputs once one is poisoned.
    pub fail_fast: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            computed_values: false,
            run_timeout: None,
            fail_fast: true,
        }
    }
}

/// The runtime executor: scheduler, resilience state, and backends shared
/// across runs.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
}

struct ExecutorShared {
    scheduler: Scheduler,
    resilience: Resilience,
    backends: Backends,
}

/// Handle on a cancellable run.
pub struct RunHandle {
    token: CancellationToken,
    join: JoinHandle<Result<DataSignature, NodeError>>,
}

impl RunHandle {
    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the run to finish (including after cancellation).
    pub async fn wait(self) -> Result<DataSignature, NodeError> {
        self.join.await.unwrap_or(Err(NodeError::Cancelled))
    }
}

impl Executor {
    pub fn new(scheduler: Scheduler, resilience: Resilience, backends: Backends) -> Executor {
        Executor {
            shared: Arc::new(ExecutorShared {
                scheduler,
                resilience,
                backends,
            }),
        }
    }

    /// Runs a pipeline to completion.
    pub async fn run(
        &self,
        image: Arc<PipelineImage>,
        registry: Arc<ModuleRegistry>,
        inputs: IndexMap<String, Value>,
        options: RunOptions,
    ) -> Result<DataSignature, NodeError> {
        run_with(
            Arc::clone(&self.shared),
            image,
            registry,
            inputs,
            options,
            CancellationToken::new(),
            None,
        )
        .await
    }

    /// Starts a run and returns a cancellation handle.
    pub fn run_cancellable(
        &self,
        image: Arc<PipelineImage>,
        registry: Arc<ModuleRegistry>,
        inputs: IndexMap<String, Value>,
        options: RunOptions,
    ) -> RunHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(run_with(
            Arc::clone(&self.shared),
            image,
            registry,
            inputs,
            options,
            token.clone(),
            None,
        ));
        RunHandle { token, join }
    }

    /// Continues a suspended execution with additional inputs. Nodes that
    /// already fired are not re-executed; their snapshotted values are used.
    pub async fn resume(
        &self,
        image: Arc<PipelineImage>,
        registry: Arc<ModuleRegistry>,
        suspended: SuspendedExecution,
        additional_inputs: IndexMap<String, Value>,
        options: RunOptions,
    ) -> Result<DataSignature, NodeError> {
        run_with(
            Arc::clone(&self.shared),
            image,
            registry,
            additional_inputs,
            options,
            CancellationToken::new(),
            Some(suspended),
        )
        .await
    }
}

// ---------------------------------------------------------------------
// Run context shared by all tasks of one run
// ---------------------------------------------------------------------

struct RunCtx {
    shared: Arc<ExecutorShared>,
    image: Arc<PipelineImage>,
    registry: Arc<ModuleRegistry>,
    descriptors: HashMap<NodeId, Arc<ModuleDescriptor>>,
    cells: HashMap<NodeId, Arc<Completable>>,
    status: StatusMap,
    token: CancellationToken,
}

impl RunCtx {
    fn dag(&self) -> &DagSpec {
        &self.image.spec
    }

    fn cell(&self, id: NodeId) -> &Arc<Completable> {
        &self.cells[&id]
    }

    /// Awaits a data cell, mapping an upstream failure to the input-failure
    /// cause naming the upstream node. Cancellation passes through.
    async fn await_cell(&self, id: NodeId) -> Result<Value, NodeError> {
        let mut reader = self.cell(id).reader();
        tokio::select! {
            resolved = reader.await_value() => resolved.map_err(|error| match error {
                NodeError::Cancelled => NodeError::Cancelled,
                _ => NodeError::InputFailure {
                    upstream: self.dag().display_name(id),
                },
            }),
            _ = self.token.cancelled() => Err(NodeError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------
// The run protocol
// ---------------------------------------------------------------------

async fn run_with(
    shared: Arc<ExecutorShared>,
    image: Arc<PipelineImage>,
    registry: Arc<ModuleRegistry>,
    supplied: IndexMap<String, Value>,
    options: RunOptions,
    token: CancellationToken,
    prior: Option<SuspendedExecution>,
) -> Result<DataSignature, NodeError> {
    let execution_id = Uuid::new_v4();
    let spec = &image.spec;

    // Snapshot bookkeeping.
    let resumption_count = match &prior {
        Some(snapshot) => {
            if snapshot.pipeline_hash != image.hash {
                return Err(NodeError::SnapshotMismatch {
                    snapshot: snapshot.pipeline_hash.to_string(),
                    pipeline: image.hash.to_string(),
                });
            }
            snapshot.resumption_count + 1
        }
        None => 0,
    };
    let mut inputs = supplied;
    if let Some(snapshot) = &prior {
        for (name, value) in &snapshot.inputs {
            inputs
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    // 1. Resolve every module to a descriptor; fail fast when one is
    //    missing.
    let mut descriptors = HashMap::new();
    for id in spec.module_ids() {
        let node = spec.module_node(id)?;
        let Some(descriptor) = registry.resolve(&node.module, node.min_version) else {
            return Err(NodeError::MissingModule {
                name: node.module.clone(),
            });
        };
        descriptors.insert(id, descriptor);
    }

    // 2. Validate supplied inputs strictly, before anything runs.
    let mut cell_inputs: IndexMap<String, Value> = IndexMap::with_capacity(inputs.len());
    for (name, value) in &inputs {
        let Some(node_id) = spec.inputs.get(name) else {
            return Err(NodeError::UnexpectedInput { name: name.clone() });
        };
        let declared = &spec.data_node(*node_id)?.ty;
        let actual = value.type_of();
        let coerced = if actual.is_subtype_of(declared) {
            value.clone()
        } else if let DataType::Optional(inner) = declared {
            // A bare value fills an optional input as present.
            if actual.is_subtype_of(inner) {
                Value::present(value.clone())
            } else {
                return Err(NodeError::InputTypeMismatch {
                    name: name.clone(),
                    expected: declared.to_string(),
                    actual: actual.to_string(),
                });
            }
        } else {
            return Err(NodeError::InputTypeMismatch {
                name: name.clone(),
                expected: declared.to_string(),
                actual: actual.to_string(),
            });
        };
        cell_inputs.insert(name.clone(), coerced);
    }

    // 3. Allocate a cell per data node, seed from the snapshot, fill
    //    inputs.
    let mut cells: HashMap<NodeId, Arc<Completable>> = HashMap::new();
    for id in spec.data_ids() {
        cells.insert(id, Arc::new(Completable::new()));
    }
    let status = StatusMap::new();
    if let Some(snapshot) = &prior {
        for (node, value) in &snapshot.completed {
            if let Some(cell) = cells.get(node) {
                if cell.is_empty() {
                    cell.complete(value.clone());
                }
            }
        }
        // Only Fired nodes are final across resumptions; failed or timed
        // nodes run again.
        for (node, node_status) in &snapshot.statuses {
            if matches!(node_status, ModuleStatus::Fired { .. }) {
                status.seed(*node, node_status.clone());
            }
        }
    }
    let mut missing: Vec<String> = Vec::new();
    for (name, node_id) in &spec.inputs {
        let cell = &cells[node_id];
        if !cell.is_empty() {
            continue;
        }
        if let Some(value) = cell_inputs.get(name) {
            cell.complete(value.clone());
            continue;
        }
        let data = spec.data_node(*node_id)?;
        let required = matches!(data.role, DataRole::Input { required: true, .. });
        if required && !matches!(data.ty, DataType::Optional(_)) {
            missing.push(name.clone());
        } else {
            cell.complete(Value::absent());
        }
    }

    if !missing.is_empty() {
        if !spec.resumable {
            return Err(NodeError::MissingInput {
                name: missing.remove(0),
            });
        }
        // Suspended outcome: snapshot what has resolved so far.
        let snapshot = capture_snapshot(spec, image.hash, resumption_count, &cells, &status, &inputs, missing.clone());
        let signature = DataSignature {
            execution_id,
            pipeline_hash: image.hash,
            resumption_count,
            status: RunStatus::Suspended,
            inputs,
            computed: None,
            outputs: IndexMap::new(),
            missing_inputs: missing,
            suspended: Some(snapshot),
            node_meta: Vec::new(),
        };
        shared.backends.listener.on_event(&ExecutionEvent::RunCompleted {
            signature: signature.clone(),
        });
        return Ok(signature);
    }

    // 4. Spawn one task per module node and per transform node; resumed
    //    nodes whose outputs are already filled are skipped.
    let ctx = Arc::new(RunCtx {
        shared: Arc::clone(&shared),
        image: Arc::clone(&image),
        registry,
        descriptors,
        cells,
        status,
        token: token.clone(),
    });
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for id in ctx.dag().module_ids() {
        let outputs = ctx.dag().module_outputs(id);
        let fired = prior.as_ref().is_some_and(|s| s.fired(id));
        let prefilled = outputs.iter().all(|(_, out)| !ctx.cell(*out).is_empty());
        if fired && prefilled {
            continue;
        }
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            module_task(ctx, id).await;
        }));
    }
    for id in ctx.dag().data_ids() {
        let data = ctx.dag().data_node(id)?;
        if data.transform.is_none() || !ctx.cell(id).is_empty() {
            continue;
        }
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            transform_task(ctx, id).await;
        }));
    }

    // 5. Await the output-bound cells, racing cancellation and the global
    //    timeout.
    let mut results: IndexMap<String, Result<Value, NodeError>> = IndexMap::new();
    let mut cancelled = false;
    {
        let mut pending: FuturesUnordered<_> = ctx
            .dag()
            .outputs
            .iter()
            .map(|(name, node)| {
                let name = name.clone();
                let node = *node;
                let ctx = Arc::clone(&ctx);
                async move {
                    let mut reader = ctx.cell(node).reader();
                    (name, reader.await_value().await)
                }
            })
            .collect();
        let deadline = options.run_timeout.map(tokio::time::sleep);
        tokio::pin!(deadline);
        loop {
            let next = async {
                match deadline.as_mut().as_pin_mut() {
                    Some(sleep) => tokio::select! {
                        item = pending.next() => Ok(item),
                        _ = sleep => Err(()),
                    },
                    None => Ok(pending.next().await),
                }
            };
            tokio::select! {
                item = next => match item {
                    Ok(Some((name, result))) => {
                        let failed = result.is_err();
                        results.insert(name, result);
                        if failed && options.fail_fast {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(()) => {
                        cancelled = true;
                        break;
                    }
                },
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }
    }

    // 6. Quiesce: stop every outstanding task, then poison whatever never
    //    resolved so late observers see a definite state.
    token.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    for cell in ctx.cells.values() {
        cell.poison(NodeError::Cancelled);
    }

    // 7. Assemble the signature.
    let mut outputs = IndexMap::new();
    let mut failures: Vec<NodeFailure> = Vec::new();
    for (name, node) in &ctx.dag().outputs {
        match results.get(name) {
            Some(Ok(value)) => {
                outputs.insert(name.clone(), value.clone());
            }
            Some(Err(error)) => failures.push(NodeFailure {
                node: *node,
                name: name.clone(),
                error: error.clone(),
            }),
            None => failures.push(NodeFailure {
                node: *node,
                name: name.clone(),
                error: NodeError::Cancelled,
            }),
        }
    }
    let mut node_meta = Vec::new();
    for id in ctx.dag().module_ids() {
        let node_status = ctx.status.get(id);
        let (latency, context) = match &node_status {
            ModuleStatus::Fired {
                latency_ms,
                context,
            } => (Some(*latency_ms), context.clone()),
            ModuleStatus::Timed { latency_ms } => (Some(*latency_ms), None),
            _ => (None, None),
        };
        if let ModuleStatus::Failed { error } = &node_status {
            failures.push(NodeFailure {
                node: id,
                name: ctx.dag().display_name(id),
                error: error.clone(),
            });
        }
        node_meta.push(NodeMeta {
            node: id,
            name: ctx.dag().display_name(id),
            status: node_status,
            latency_ms: latency,
            context,
        });
    }

    let completed = !cancelled && outputs.len() == ctx.dag().outputs.len();
    let run_status = if completed {
        RunStatus::Completed
    } else {
        let mut run_failures: Vec<NodeFailure> = failures
            .iter()
            .filter(|f| !completed_failure_only(&outputs, f))
            .cloned()
            .collect();
        if run_failures.is_empty() {
            run_failures.push(NodeFailure {
                node: NodeId(0),
                name: "run".to_string(),
                error: NodeError::Cancelled,
            });
        }
        RunStatus::Failed(run_failures)
    };

    let computed = options.computed_values.then(|| {
        let mut values = IndexMap::new();
        for id in ctx.dag().data_ids() {
            if ctx.dag().inputs.values().any(|input| *input == id) {
                continue;
            }
            if let Some(value) = ctx.cell(id).value() {
                values.insert(ctx.dag().display_name(id), value);
            }
        }
        values
    });

    let suspended = spec.resumable.then(|| {
        capture_snapshot(
            ctx.dag(),
            image.hash,
            resumption_count,
            &ctx.cells,
            &ctx.status,
            &inputs,
            Vec::new(),
        )
    });

    let signature = DataSignature {
        execution_id,
        pipeline_hash: image.hash,
        resumption_count,
        status: run_status,
        inputs,
        computed,
        outputs,
        missing_inputs: Vec::new(),
        suspended,
        node_meta,
    };
    ctx.shared
        .backends
        .listener
        .on_event(&ExecutionEvent::RunCompleted {
            signature: signature.clone(),
        });
    debug!(execution = %execution_id, status = ?signature.status.is_completed(), "run finished");
    Ok(signature)
}

/// Failures that do not gate completion: a node error whose output still
/// resolved (fallback, skip, log, wrap) is reported but not fatal.
fn completed_failure_only(outputs: &IndexMap<String, Value>, failure: &NodeFailure) -> bool {
    outputs.contains_key(&failure.name)
}

fn capture_snapshot(
    spec: &DagSpec,
    pipeline_hash: flowlang_core::hash::ContentHash,
    resumption_count: u32,
    cells: &HashMap<NodeId, Arc<Completable>>,
    status: &StatusMap,
    inputs: &IndexMap<String, Value>,
    missing: Vec<String>,
) -> SuspendedExecution {
    let mut completed: Vec<(NodeId, Value)> = Vec::new();
    for id in spec.data_ids() {
        if let Some(value) = cells[&id].value() {
            completed.push((id, value));
        }
    }
    completed.sort_by_key(|(id, _)| *id);
    SuspendedExecution {
        pipeline_hash,
        resumption_count,
        completed,
        statuses: status.snapshot(),
        inputs: inputs.clone(),
        missing_inputs: missing,
    }
}

// ---------------------------------------------------------------------
// Module tasks
// ---------------------------------------------------------------------

async fn module_task(ctx: Arc<RunCtx>, id: NodeId) {
    let Ok(node) = ctx.dag().module_node(id).cloned() else {
        return;
    };
    let descriptor = Arc::clone(&ctx.descriptors[&id]);
    let outputs = ctx.dag().module_outputs(id);
    let poison_outputs = |error: NodeError| {
        for (_, out) in &outputs {
            ctx.cell(*out).poison(error.clone());
        }
    };

    // Gate: a guarded module fires only when its condition holds.
    if let Some(gate) = node.gate {
        match ctx.await_cell(gate).await {
            Ok(condition) => match condition.as_boolean() {
                Ok(true) => {}
                Ok(false) => return, // stays Unfired, outputs stay empty
                Err(error) => {
                    poison_outputs(NodeError::Transform(error));
                    return;
                }
            },
            Err(error) => {
                poison_outputs(error);
                return;
            }
        }
    }

    // Await inputs under the inputs timeout.
    let wait_started = Instant::now();
    let sources = ctx.dag().module_params(id);
    let gather = async {
        let mut values: IndexMap<String, Value> = IndexMap::with_capacity(sources.len());
        for (param, _) in &node.signature.consumes {
            let Some((_, source)) = sources.iter().find(|(p, _)| p == param) else {
                return Err(NodeError::MissingInput {
                    name: param.clone(),
                });
            };
            let value = ctx.await_cell(*source).await?;
            values.insert(param.clone(), value);
        }
        Ok(values)
    };
    let inputs = match tokio::time::timeout(descriptor.config.inputs_timeout, gather).await {
        Ok(Ok(values)) => values,
        Ok(Err(error)) => {
            poison_outputs(error);
            return;
        }
        Err(_) => {
            let waited = wait_started.elapsed();
            ctx.status.set(
                id,
                ModuleStatus::Timed {
                    latency_ms: waited.as_millis() as u64,
                },
            );
            poison_outputs(NodeError::InputWaitTimeout {
                waited_ms: waited.as_millis() as u64,
            });
            return;
        }
    };

    // Admission by the scheduler, then run.
    let permit = tokio::select! {
        permit = ctx.shared.scheduler.admit(node.config.priority) => permit,
        _ = ctx.token.cancelled() => {
            poison_outputs(NodeError::Cancelled);
            return;
        }
    };

    ctx.status.set(id, ModuleStatus::Running);
    ctx.shared
        .backends
        .listener
        .on_event(&ExecutionEvent::NodeStarted {
            node: id,
            name: node.display_name.clone(),
        });
    let span = ctx.shared.backends.tracer.span(
        "module.invoke",
        &[
            ("module", node.module.clone()),
            ("node", id.to_string()),
        ],
    );
    let started = Instant::now();

    let result = invoke_with_policies(&ctx, &node, &descriptor, &inputs).await;
    drop(permit);
    drop(span);
    let latency_ms = started.elapsed().as_millis() as u64;
    ctx.shared
        .backends
        .metrics
        .histogram("flowlang.module.latency_ms", latency_ms as f64);

    match result {
        Ok(record) => {
            if let Err(error) = distribute_outputs(&ctx, &node, &outputs, &record, None) {
                ctx.status
                    .set(id, ModuleStatus::Failed { error: error.clone() });
                poison_outputs(error);
            } else {
                ctx.status.set(
                    id,
                    ModuleStatus::Fired {
                        latency_ms,
                        context: None,
                    },
                );
            }
        }
        Err(error) => {
            handle_failure(&ctx, id, &node, &descriptor.signature, &outputs, &inputs, error, latency_ms)
                .await;
        }
    }

    let final_status = ctx.status.get(id);
    ctx.shared
        .backends
        .listener
        .on_event(&ExecutionEvent::NodeCompleted {
            node: id,
            name: node.display_name.clone(),
            status: final_status,
        });
}

/// Applies fallback and the `on_error` strategy to a terminal failure,
/// filling or poisoning the output cells and recording the status.
#[allow(clippy::too_many_arguments)]
async fn handle_failure(
    ctx: &Arc<RunCtx>,
    id: NodeId,
    node: &flowlang_core::dag::ModuleNodeSpec,
    signature: &ModuleSignature,
    outputs: &[(String, NodeId)],
    inputs: &IndexMap<String, Value>,
    error: NodeError,
    latency_ms: u64,
) {
    let poison_outputs = |error: NodeError| {
        for (_, out) in outputs {
            ctx.cell(*out).poison(error.clone());
        }
    };
    let record_status = |error: &NodeError| {
        let status = match error {
            NodeError::ModuleTimeout { .. } => ModuleStatus::Timed { latency_ms },
            _ => ModuleStatus::Failed {
                error: error.clone(),
            },
        };
        ctx.status.set(id, status);
    };

    // Fallback: a sub-DAG bound to the module's own inputs.
    if let Some(fallback) = &node.config.fallback {
        match run_fallback(ctx, fallback, inputs).await {
            Ok(value) => {
                record_status(&error);
                if signature.produces.len() == 1 {
                    ctx.cell(outputs[0].1).complete(value);
                } else if let Err(distribute_error) =
                    distribute_record_fields(ctx, outputs, &value)
                {
                    poison_outputs(distribute_error);
                }
                return;
            }
            Err(fallback_error) => {
                debug!(module = %node.module, error = %fallback_error, "fallback failed");
            }
        }
    }

    record_status(&error);
    match node.config.on_error {
        OnError::Propagate => poison_outputs(error),
        OnError::Skip | OnError::Log => {
            if matches!(node.config.on_error, OnError::Log) {
                warn!(module = %node.module, error = %error, "module failed; yielding zero value");
            }
            for (field, out) in outputs {
                let field_ty = &signature.produces[field.as_str()];
                match Value::zero_of(field_ty) {
                    Ok(zero) => ctx.cell(*out).complete(zero),
                    Err(core_error) => ctx.cell(*out).poison(NodeError::Transform(core_error)),
                }
            }
        }
        OnError::Wrap => {
            // Wrap is restricted to single-output modules at compile time.
            let wrapped = Value::record([("err", Value::String(error.to_string()))]);
            ctx.cell(outputs[0].1).complete(wrapped);
        }
    }
}

/// Runs the resilience policy stack around one module invocation:
/// throttle → concurrency → circuit breaker → cache → retry/timeout.
async fn invoke_with_policies(
    ctx: &Arc<RunCtx>,
    node: &flowlang_core::dag::ModuleNodeSpec,
    descriptor: &Arc<ModuleDescriptor>,
    inputs: &IndexMap<String, Value>,
) -> Result<Value, NodeError> {
    let config = &node.config;
    let module = node.module.as_str();
    let timeout_limit = config.timeout.unwrap_or(descriptor.config.module_timeout);

    // Throttle: tokens shared per logical module name. A wait that cannot
    // finish inside the module's own time budget fails fast.
    if let Some(rate) = config.throttle {
        let waited = tokio::select! {
            outcome = tokio::time::timeout(timeout_limit, ctx.shared.resilience.throttle(module, rate)) => outcome,
            _ = ctx.token.cancelled() => return Err(NodeError::Cancelled),
        };
        if waited.is_err() {
            return Err(NodeError::ThrottleExceeded {
                module: module.to_string(),
            });
        }
    }

    // Concurrency cap per module name.
    let _concurrency_permit = match config.concurrency {
        Some(limit) => {
            let semaphore = ctx.shared.resilience.concurrency(module, limit);
            tokio::select! {
                permit = semaphore.acquire_owned() => Some(permit.expect("semaphore never closes")),
                _ = ctx.token.cancelled() => return Err(NodeError::Cancelled),
            }
        }
        None => None,
    };

    // Circuit breaker.
    let probe = ctx.shared.resilience.circuit_admit(module)?;
    let mut probe_outstanding = probe;

    // Cache lookup before execution.
    let cache_key = hash_named_inputs(
        module,
        inputs.iter().map(|(name, value)| (name.as_str(), value)),
    );
    let cache = config
        .cache_ttl
        .and_then(|_| ctx.shared.backends.cache(config.cache_backend.as_deref()));
    if let Some(backend) = &cache {
        if let Some((value, _expires_at)) = backend.get(&cache_key).await {
            ctx.shared
                .resilience
                .circuit_record(module, true, probe_outstanding);
            return Ok(value);
        }
    }

    // Retry loop: `retry: n` allows n total attempts.
    let max_attempts = config.retry.unwrap_or(0).max(1);
    let mut attempt = 1u32;
    loop {
        let outcome = attempt_invoke(ctx, descriptor, inputs, timeout_limit).await;
        match outcome {
            Ok(value) => {
                ctx.shared
                    .resilience
                    .circuit_record(module, true, probe_outstanding);
                if let (Some(backend), Some(ttl)) = (&cache, config.cache_ttl) {
                    backend.put(cache_key, value.clone(), ttl).await;
                }
                ctx.shared
                    .backends
                    .metrics
                    .counter("flowlang.module.success", 1);
                return Ok(value);
            }
            Err(error) => {
                ctx.shared
                    .resilience
                    .circuit_record(module, false, probe_outstanding);
                probe_outstanding = false;
                ctx.shared
                    .backends
                    .metrics
                    .counter("flowlang.module.failure", 1);
                if matches!(error, NodeError::Cancelled) {
                    return Err(error);
                }
                if attempt < max_attempts && error.is_transient() {
                    let base = config.delay.unwrap_or(Duration::ZERO);
                    let delay = ctx
                        .shared
                        .resilience
                        .retry_delay(config.backoff, base, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.token.cancelled() => return Err(NodeError::Cancelled),
                    }
                    attempt += 1;
                    continue;
                }
                if config.retry.unwrap_or(0) > 1 && attempt == max_attempts {
                    return Err(NodeError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                return Err(error);
            }
        }
    }
}

/// One invocation attempt under the per-attempt timeout.
async fn attempt_invoke(
    ctx: &Arc<RunCtx>,
    descriptor: &Arc<ModuleDescriptor>,
    inputs: &IndexMap<String, Value>,
    limit: Duration,
) -> Result<Value, NodeError> {
    let record = Value::Record(inputs.clone());
    let invocation = descriptor.implementation.invoke(record);
    tokio::select! {
        outcome = tokio::time::timeout(limit, invocation) => match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(module_error)) => Err(NodeError::ModuleFailure {
                error: module_error,
            }),
            Err(_) => Err(NodeError::ModuleTimeout {
                limit_ms: limit.as_millis() as u64,
            }),
        },
        _ = ctx.token.cancelled() => Err(NodeError::Cancelled),
    }
}

/// Validates a module's output record and fills the per-field cells. With
/// `on_error: wrap`, a success fills the single output as `{ok: value}`.
fn distribute_outputs(
    ctx: &Arc<RunCtx>,
    node: &flowlang_core::dag::ModuleNodeSpec,
    outputs: &[(String, NodeId)],
    record: &Value,
    _context: Option<String>,
) -> Result<(), NodeError> {
    let fields = record.as_record().map_err(NodeError::Transform)?;
    // Validate the whole record before filling any cell, so a bad output
    // never leaves a half-published producer.
    let mut filled: Vec<(NodeId, Value)> = Vec::with_capacity(outputs.len());
    for (field, out) in outputs {
        let Some(value) = fields.get(field) else {
            return Err(NodeError::ModuleFailure {
                error: flowlang_core::module::ModuleError::Fatal(format!(
                    "module '{}' produced no output field '{field}'",
                    node.module
                )),
            });
        };
        let declared = &node.signature.produces[field.as_str()];
        if !value.type_of().is_subtype_of(declared) {
            return Err(NodeError::ModuleFailure {
                error: flowlang_core::module::ModuleError::Fatal(format!(
                    "module '{}' output '{field}': expected {declared}, got {}",
                    node.module,
                    value.type_of()
                )),
            });
        }
        let value = if matches!(node.config.on_error, OnError::Wrap) {
            Value::record([("ok", value.clone())])
        } else {
            value.clone()
        };
        filled.push((*out, value));
    }
    for (out, value) in filled {
        ctx.cell(out).complete(value);
    }
    Ok(())
}

/// Fills per-field cells from a record value (used by multi-output
/// fallbacks).
fn distribute_record_fields(
    ctx: &Arc<RunCtx>,
    outputs: &[(String, NodeId)],
    record: &Value,
) -> Result<(), NodeError> {
    let fields = record.as_record().map_err(NodeError::Transform)?;
    for (field, out) in outputs {
        let Some(value) = fields.get(field) else {
            return Err(NodeError::Transform(
                flowlang_core::error::CoreError::InvalidFieldAccess {
                    field: field.clone(),
                    available: fields.keys().cloned().collect(),
                },
            ));
        };
        ctx.cell(*out).complete(value.clone());
    }
    Ok(())
}

/// Executes a fallback sub-DAG bound to the module's input values.
fn run_fallback<'a>(
    ctx: &'a Arc<RunCtx>,
    fallback: &'a DagSpec,
    inputs: &'a IndexMap<String, Value>,
) -> BoxFuture<'a, Result<Value, NodeError>> {
    Box::pin(async move {
        let image = Arc::new(PipelineImage::new("fallback", fallback.clone()));
        let bound: IndexMap<String, Value> = fallback
            .inputs
            .keys()
            .filter_map(|name| inputs.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        let signature = run_with(
            Arc::clone(&ctx.shared),
            image,
            Arc::clone(&ctx.registry),
            bound,
            RunOptions::default(),
            ctx.token.child_token(),
            None,
        )
        .await?;
        match signature.status {
            RunStatus::Completed => signature
                .outputs
                .get("result")
                .cloned()
                .ok_or(NodeError::Cancelled),
            RunStatus::Failed(mut failures) => Err(failures
                .pop()
                .map(|f| f.error)
                .unwrap_or(NodeError::Cancelled)),
            RunStatus::Suspended => Err(NodeError::Cancelled),
        }
    })
}

// ---------------------------------------------------------------------
// Transform tasks
// ---------------------------------------------------------------------

async fn transform_task(ctx: Arc<RunCtx>, id: NodeId) {
    let Ok(data) = ctx.dag().data_node(id).cloned() else {
        return;
    };
    let Some(spec) = data.transform else {
        return;
    };
    let cell = Arc::clone(ctx.cell(id));
    match eval_transform(&ctx, &spec).await {
        Ok(value) => cell.complete(value),
        Err(error) => cell.poison(error),
    }
}

/// Evaluates an inline transform with selective awaiting for control
/// transforms.
async fn eval_transform(ctx: &Arc<RunCtx>, spec: &TransformSpec) -> Result<Value, NodeError> {
    let input = |i: usize| ctx.await_cell(spec.inputs[i]);
    match &spec.transform {
        Transform::Conditional => {
            let cond = input(0).await?.as_boolean().map_err(NodeError::Transform)?;
            if cond {
                input(1).await
            } else {
                input(2).await
            }
        }
        Transform::Branch { arm_count } => {
            for i in 0..*arm_count {
                let cond = input(2 * i)
                    .await?
                    .as_boolean()
                    .map_err(NodeError::Transform)?;
                if cond {
                    return input(2 * i + 1).await;
                }
            }
            input(2 * arm_count).await
        }
        Transform::Guard => {
            let cond = input(0).await?.as_boolean().map_err(NodeError::Transform)?;
            if cond {
                Ok(Value::present(input(1).await?))
            } else {
                Ok(Value::absent())
            }
        }
        Transform::Coalesce => match input(0).await? {
            Value::Optional(Some(inner)) => Ok(*inner),
            Value::Optional(None) => input(1).await,
            other => Err(NodeError::Transform(
                flowlang_core::error::CoreError::type_mismatch("Optional", other.kind_name()),
            )),
        },
        Transform::Match { patterns, bodies } => {
            let scrutinee = input(0).await?;
            let actual = scrutinee.type_of();
            let Some(index) = patterns
                .iter()
                .position(|pattern| actual.is_subtype_of(pattern))
            else {
                return Err(NodeError::Transform(
                    flowlang_core::error::CoreError::NoMatchingArm { actual },
                ));
            };
            let Some(body) = bodies.get(index) else {
                return Err(NodeError::Transform(
                    flowlang_core::error::CoreError::InvariantViolation {
                        reason: format!("match arm {index} has no body"),
                    },
                ));
            };
            // Await only the captures the taken arm reads; slot k is
            // transform input k. Cells referenced solely by untaken arms
            // are never awaited, so their failures cannot poison the
            // result.
            let mut captures = vec![Value::absent(); spec.inputs.len().saturating_sub(1)];
            for slot in body.referenced_slots() {
                if slot == 0 {
                    continue; // the scrutinee itself
                }
                let Some(source) = spec.inputs.get(slot) else {
                    return Err(NodeError::Transform(
                        flowlang_core::error::CoreError::InvariantViolation {
                            reason: format!("match arm reads missing capture slot {slot}"),
                        },
                    ));
                };
                captures[slot - 1] = ctx.await_cell(*source).await?;
            }
            body.eval(&scrutinee, &captures).map_err(NodeError::Transform)
        }
        Transform::And => {
            let left = input(0).await?.as_boolean().map_err(NodeError::Transform)?;
            if !left {
                return Ok(Value::Boolean(false));
            }
            let right = input(1).await?.as_boolean().map_err(NodeError::Transform)?;
            Ok(Value::Boolean(right))
        }
        Transform::Or => {
            let left = input(0).await?.as_boolean().map_err(NodeError::Transform)?;
            if left {
                return Ok(Value::Boolean(true));
            }
            let right = input(1).await?.as_boolean().map_err(NodeError::Transform)?;
            Ok(Value::Boolean(right))
        }
        transform => {
            let mut values = Vec::with_capacity(spec.inputs.len());
            for source in &spec.inputs {
                values.push(ctx.await_cell(*source).await?);
            }
            transform.apply(&values).map_err(NodeError::Transform)
        }
    }
}
