//! Workflow executor
//!
//! Drives one run end-to-end: asks the scheduler for ready nodes,
//! dispatches them in parallel through the reliability envelope, merges
//! state patches through a single writer, records outcomes, persists
//! checkpoints, and emits events, spans and metrics. Timer and human
//! nodes suspend the run durably; the timer manager and approval store
//! resume it through [`Executor::resume_latest`].

mod envelope;
mod events;

pub use events::{ExecutionCallbacks, ExecutionEvent};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use windlass_observability::{metrics::names, MetricsRegistry, TraceContext, Tracer};

use crate::approval::ApprovalManager;
use crate::cancel::CancelToken;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, NodeError};
use crate::model::{
    NodeContext, NodeKind, NodeOutcome, Run, RunResult, RunStatus, StatePatch, WaitReason,
    Workflow,
};
use crate::reliability::{
    CircuitBreakerRegistry, CompensationManager, DeadLetterQueue, IdempotencyStore, RetryPolicy,
};
use crate::scheduler;
use crate::timer::{TimerStatus, TimerStore};

use envelope::DispatchResult;
use events::EventSink;

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Parallel dispatch bound per run (default 4)
    pub max_concurrency: usize,

    /// Scheduler iteration cap per run (default 100)
    pub max_iterations: u32,

    /// Retry policy for nodes without their own (default: no retries)
    pub default_retry: RetryPolicy,

    /// Per-attempt deadline for nodes without their own
    #[serde(default, with = "option_duration_millis")]
    pub default_timeout: Option<Duration>,

    /// Checkpoint after each committed boundary when a store is present
    pub checkpoint: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_iterations: 100,
            default_retry: RetryPolicy::no_retry(),
            default_timeout: None,
            checkpoint: true,
        }
    }
}

impl ExecutorConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parallel dispatch bound
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the iteration cap
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    /// Set the default retry policy
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Set the default per-attempt timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

/// Per-run execution options
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Patch merged into the workflow's initial state
    pub input: Option<StatePatch>,

    /// Override the executor's dispatch bound
    pub max_concurrency: Option<usize>,

    /// Override the executor's iteration cap
    pub max_iterations: Option<u32>,

    /// Override checkpointing for this run
    pub checkpoint: Option<bool>,

    /// Run-level cancellation token
    pub cancel: CancelToken,

    /// Subworkflow nesting depth (0 for a top-level run)
    pub depth: u32,

    /// Trace context inherited from a parent span
    pub trace: Option<TraceContext>,

    /// Event channel for the streaming variant
    pub events: Option<mpsc::Sender<ExecutionEvent>>,

    /// Callback hooks
    pub callbacks: Option<Arc<ExecutionCallbacks>>,

    /// Saga scopes whose compensations may run concurrently
    pub parallel_compensation_scopes: Vec<String>,
}

impl ExecuteOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a patch into the initial state
    pub fn with_input(mut self, input: StatePatch) -> Self {
        self.input = Some(input);
        self
    }

    /// Override the dispatch bound
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max.max(1));
        self
    }

    /// Override the iteration cap
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max.max(1));
        self
    }

    /// Override checkpointing
    pub fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Use the given cancellation token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the nesting depth
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Inherit a trace context
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Attach callbacks
    pub fn with_callbacks(mut self, callbacks: ExecutionCallbacks) -> Self {
        self.callbacks = Some(Arc::new(callbacks));
        self
    }

    /// Allow a saga scope's compensations to run concurrently
    pub fn with_parallel_compensation_scope(mut self, scope: impl Into<String>) -> Self {
        self.parallel_compensation_scopes.push(scope.into());
        self
    }
}

/// Drives workflow runs
///
/// Stores and observability are optional seams: an executor with nothing
/// attached still runs workflows, it just cannot checkpoint, suspend,
/// deduplicate or trace them.
///
/// # Example
///
/// ```ignore
/// let executor = Arc::new(
///     Executor::new(ExecutorConfig::default())
///         .with_checkpoint_store(store)
///         .with_dead_letter_queue(dlq),
/// );
/// let result = executor.execute(workflow, ExecuteOptions::new()).await?;
/// ```
pub struct Executor {
    pub(crate) config: ExecutorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub(crate) idempotency: Option<Arc<dyn IdempotencyStore>>,
    pub(crate) dlq: Option<Arc<dyn DeadLetterQueue>>,
    pub(crate) timers: Option<Arc<dyn TimerStore>>,
    pub(crate) approvals: Option<Arc<ApprovalManager>>,
    pub(crate) tracer: Option<Arc<Tracer>>,
    pub(crate) metrics: Option<Arc<MetricsRegistry>>,
}

impl Executor {
    /// Create an executor with the given config
    pub fn new(config: ExecutorConfig) -> Self {
        let clock: Arc<dyn Clock> = SystemClock::shared();
        Self {
            config,
            breakers: Arc::new(CircuitBreakerRegistry::new(Arc::clone(&clock))),
            clock,
            checkpoints: None,
            idempotency: None,
            dlq: None,
            timers: None,
            approvals: None,
            tracer: None,
            metrics: None,
        }
    }

    /// Replace the clock (also rebuilds the breaker registry on it)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.breakers = Arc::new(CircuitBreakerRegistry::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    /// Attach a checkpoint store
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Attach an idempotency store
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    /// Attach a dead-letter queue
    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Attach a timer store (enables timer nodes)
    pub fn with_timer_store(mut self, store: Arc<dyn TimerStore>) -> Self {
        self.timers = Some(store);
        self
    }

    /// Attach an approval manager (enables human nodes)
    pub fn with_approval_manager(mut self, manager: Arc<ApprovalManager>) -> Self {
        self.approvals = Some(manager);
        self
    }

    /// Attach a tracer
    pub fn with_tracer(mut self, tracer: Arc<Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Attach a metrics registry
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The executor's circuit breaker registry
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Execute a workflow to completion (or suspension)
    ///
    /// The returned [`RunResult`] always carries the final state and
    /// per-node outcomes; a node failure becomes the run's terminal
    /// error rather than an `Err` from this method. `Err` is reserved
    /// for infrastructure problems (missing stores, serialization).
    #[instrument(skip(self, workflow, options), fields(workflow = %workflow.name))]
    pub async fn execute(
        &self,
        workflow: Arc<Workflow>,
        options: ExecuteOptions,
    ) -> Result<RunResult, EngineError> {
        let run = Run::new(&workflow);
        self.execute_run(workflow, run, options).await
    }

    /// Type-erased [`Self::execute`], for recursive callers (e.g. subworkflow
    /// dispatch) that would otherwise ask the compiler to size an infinitely
    /// self-referential future.
    pub(crate) fn execute_boxed(
        &self,
        workflow: Arc<Workflow>,
        options: ExecuteOptions,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<RunResult, EngineError>> + Send + '_>,
    > {
        Box::pin(self.execute(workflow, options))
    }

    /// Execute with an ordered event stream
    ///
    /// Events arrive in order: `node:start`, `node:complete` /
    /// `node:error` per node, then `workflow:complete`.
    pub fn execute_streaming(
        self: Arc<Self>,
        workflow: Arc<Workflow>,
        mut options: ExecuteOptions,
    ) -> (
        ReceiverStream<ExecutionEvent>,
        JoinHandle<Result<RunResult, EngineError>>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        options.events = Some(tx);
        let handle = tokio::spawn(async move { self.execute(workflow, options).await });
        (ReceiverStream::new(rx), handle)
    }

    /// Resume a run from a specific checkpoint
    pub async fn resume(
        &self,
        workflow: Arc<Workflow>,
        checkpoint_id: Uuid,
        options: ExecuteOptions,
    ) -> Result<RunResult, EngineError> {
        let store = self.checkpoints.as_ref().ok_or_else(|| {
            EngineError::Configuration("resume requires a checkpoint store".to_string())
        })?;
        let checkpoint = store
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("checkpoint {checkpoint_id}")))?;
        self.resume_from_checkpoint(workflow, checkpoint, options)
            .await
    }

    /// Resume a run from its most recent checkpoint
    pub async fn resume_latest(
        &self,
        workflow: Arc<Workflow>,
        run_id: Uuid,
        options: ExecuteOptions,
    ) -> Result<RunResult, EngineError> {
        let store = self.checkpoints.as_ref().ok_or_else(|| {
            EngineError::Configuration("resume requires a checkpoint store".to_string())
        })?;
        let checkpoint = store
            .latest_for_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no checkpoint for run {run_id}")))?;
        self.resume_from_checkpoint(workflow, checkpoint, options)
            .await
    }

    /// Execute a run record created elsewhere (e.g. by the run manager)
    ///
    /// The run keeps its id, priority and state; `options.input` is
    /// merged on top before the entry point dispatches.
    pub async fn execute_run(
        &self,
        workflow: Arc<Workflow>,
        mut run: Run,
        mut options: ExecuteOptions,
    ) -> Result<RunResult, EngineError> {
        if let Some(input) = options.input.take() {
            run.state.merge(input);
        }
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        info!(run_id = %run.run_id, "run started");

        let ready = vec![workflow.entry_point.clone()];
        self.run_loop(workflow, run, ready, options).await
    }

    /// Continue a restored run
    async fn resume_from_checkpoint(
        &self,
        workflow: Arc<Workflow>,
        checkpoint: Checkpoint,
        options: ExecuteOptions,
    ) -> Result<RunResult, EngineError> {
        let mut run = checkpoint.restore(&workflow);
        let mut ready = if checkpoint.frontier.is_empty() {
            scheduler::ready_nodes(
                &workflow,
                &run.completed_nodes,
                &run.state,
                &run.loop_iterations,
            )
        } else {
            checkpoint.frontier.clone()
        };
        info!(run_id = %run.run_id, frontier = ?ready, "resuming run");

        // Settle a suspension before re-entering the loop.
        if let Some(reason) = run.waiting_on.clone() {
            match reason {
                WaitReason::Timer { timer_id, node } => {
                    let store = self.timers.as_ref().ok_or_else(|| {
                        EngineError::Configuration("timer resume requires a timer store".to_string())
                    })?;
                    match store.get(timer_id).await? {
                        Some(entry) if entry.status == TimerStatus::Fired => {
                            run.waiting_on = None;
                            self.settle_waiting_node(
                                &workflow,
                                &mut run,
                                &mut ready,
                                &node,
                                serde_json::json!({ "fired_at": entry.fire_at }),
                            );
                        }
                        Some(entry) if entry.status == TimerStatus::Pending => {
                            debug!(run_id = %run.run_id, "timer still pending");
                            run.status = RunStatus::Waiting;
                            return Ok(RunResult { run });
                        }
                        _ => {
                            run.waiting_on = None;
                            return self
                                .finish_failed(
                                    workflow,
                                    run,
                                    node.clone(),
                                    NodeError::non_retryable("timer was cancelled")
                                        .with_type("timer_cancelled"),
                                    Arc::new(CompensationManager::new(Arc::clone(&self.clock))),
                                    &EventSink::new(
                                        options.events.clone(),
                                        options.callbacks.clone(),
                                    ),
                                )
                                .await;
                        }
                    }
                }
                WaitReason::Approval { request_id, node } => {
                    let manager = self.approvals.as_ref().ok_or_else(|| {
                        EngineError::Configuration(
                            "approval resume requires an approval manager".to_string(),
                        )
                    })?;
                    let store = manager.store();
                    if let Some(response) = store.response(request_id).await? {
                        let decision_key = match workflow.node(&node).map(|n| &n.kind) {
                            Some(NodeKind::Human(config)) => config.decision_key.clone(),
                            _ => "decision".to_string(),
                        };
                        let decision_value = serde_json::json!({
                            "decision": response.decision,
                            "responded_by": response.responded_by,
                        });
                        run.state.set(decision_key, decision_value.clone());
                        run.waiting_on = None;
                        self.settle_waiting_node(
                            &workflow,
                            &mut run,
                            &mut ready,
                            &node,
                            decision_value,
                        );
                    } else {
                        let request = store.get(request_id).await?;
                        let timed_out = request
                            .map(|r| r.status == crate::approval::ApprovalStatus::TimedOut)
                            .unwrap_or(true);
                        if timed_out {
                            run.waiting_on = None;
                            return self
                                .finish_failed(
                                    workflow,
                                    run,
                                    node.clone(),
                                    NodeError::non_retryable(format!(
                                        "approval deadline passed for node {node}"
                                    ))
                                    .with_type("approval_timeout"),
                                    Arc::new(CompensationManager::new(Arc::clone(&self.clock))),
                                    &EventSink::new(
                                        options.events.clone(),
                                        options.callbacks.clone(),
                                    ),
                                )
                                .await;
                        }
                        debug!(run_id = %run.run_id, "approval still pending");
                        run.status = RunStatus::Waiting;
                        return Ok(RunResult { run });
                    }
                }
            }
        }

        self.run_loop(workflow, run, ready, options).await
    }

    /// Complete a node that was suspended, advancing the frontier
    fn settle_waiting_node(
        &self,
        workflow: &Arc<Workflow>,
        run: &mut Run,
        ready: &mut Vec<String>,
        node: &str,
        output: serde_json::Value,
    ) {
        run.record_outcome(
            node,
            NodeOutcome {
                output,
                duration: Duration::ZERO,
                attempts: 1,
                completed_at: Utc::now(),
            },
        );
        ready.retain(|n| n != node);
        let successors =
            scheduler::successors(workflow, node, &run.state, &mut run.loop_iterations);
        for reopened in &successors.reopened {
            run.completed_nodes.remove(reopened);
        }
        ready.extend(successors.nodes);
    }

    async fn run_loop(
        &self,
        workflow: Arc<Workflow>,
        mut run: Run,
        mut ready: Vec<String>,
        options: ExecuteOptions,
    ) -> Result<RunResult, EngineError> {
        let sink = EventSink::new(options.events.clone(), options.callbacks.clone());
        let max_concurrency = options
            .max_concurrency
            .unwrap_or(self.config.max_concurrency);
        let max_iterations = options.max_iterations.unwrap_or(self.config.max_iterations);
        let checkpoint_enabled =
            options.checkpoint.unwrap_or(self.config.checkpoint) && self.checkpoints.is_some();

        let compensations = Arc::new(CompensationManager::new(Arc::clone(&self.clock)));
        for scope in &options.parallel_compensation_scopes {
            compensations.set_parallel_scope(scope.clone());
        }

        let run_started = Instant::now();
        let mut iterations = 0u32;

        loop {
            let completed = run.completed_nodes.clone();
            ready.retain(|n| !completed.contains(n));
            dedup(&mut ready);
            if ready.is_empty() {
                break;
            }

            if options.cancel.is_cancelled() {
                return self.finish_cancelled(run, run_started, &sink).await;
            }

            iterations += 1;
            if iterations > max_iterations {
                warn!(run_id = %run.run_id, max_iterations, "iteration limit reached");
                return self
                    .finish_failed(
                        workflow,
                        run,
                        String::new(),
                        NodeError::non_retryable(format!(
                            "iteration limit reached ({max_iterations})"
                        ))
                        .with_type("iteration_limit"),
                        compensations,
                        &sink,
                    )
                    .await;
            }

            // Timer and human nodes suspend; run everything else first.
            let (executable, suspending): (Vec<String>, Vec<String>) =
                ready.iter().cloned().partition(|name| {
                    !matches!(
                        workflow.node(name).map(|n| &n.kind),
                        Some(NodeKind::Timer(_)) | Some(NodeKind::Human(_))
                    )
                });

            if executable.is_empty() {
                let node_name = suspending[0].clone();
                return self
                    .suspend_run(workflow, run, ready, node_name, &sink)
                    .await;
            }

            // Parallel dispatch through the envelope.
            let tasks: Vec<BoxFuture<'_, DispatchResult>> = executable
                .iter()
                .map(|name| {
                    let workflow = Arc::clone(&workflow);
                    let compensations = Arc::clone(&compensations);
                    let sink = sink.clone();
                    let ctx = NodeContext {
                        run_id: run.run_id,
                        workflow_id: run.workflow_id,
                        workflow_name: run.workflow_name.clone(),
                        node_name: name.clone(),
                        attempt: 1,
                        depth: options.depth,
                        state: run.state.clone(),
                        trace: options.trace,
                        cancel: options.cancel.clone(),
                    };
                    let name = name.clone();
                    let run_id = run.run_id;
                    let task: BoxFuture<'_, DispatchResult> = Box::pin(async move {
                        sink.emit(ExecutionEvent::NodeStart {
                            run_id,
                            node: name.clone(),
                        })
                        .await;
                        self.dispatch_node(workflow, name, ctx, compensations).await
                    });
                    task
                })
                .collect();

            let results = scheduler::dispatch_bounded(tasks, max_concurrency).await;

            // Single-writer merge of the wave's results.
            let mut next_ready: Vec<String> = suspending;
            let mut failure: Option<(String, NodeError)> = None;

            for result in results {
                let node = result.node.clone();
                match result.outcome {
                    Ok(output) => {
                        run.state.merge(output.update.clone());
                        run.tokens_used += result.tokens;
                        run.cost_micros += result.cost_micros;
                        run.record_outcome(
                            &node,
                            NodeOutcome {
                                output: output.value.clone(),
                                duration: result.duration,
                                attempts: result.attempts.max(1),
                                completed_at: Utc::now(),
                            },
                        );
                        sink.emit(ExecutionEvent::NodeComplete {
                            run_id: run.run_id,
                            node: node.clone(),
                            output: output.value.clone(),
                            duration: result.duration,
                        })
                        .await;

                        // Explicit next wins; an empty list means "no
                        // successors from this branch" and the union of
                        // sibling successor sets carries the run forward.
                        match output.next {
                            Some(list) => {
                                for target in &list {
                                    if run.completed_nodes.contains(target) {
                                        run.completed_nodes.remove(target);
                                    }
                                }
                                next_ready.extend(list);
                            }
                            None => {
                                let successors = scheduler::successors(
                                    &workflow,
                                    &node,
                                    &run.state,
                                    &mut run.loop_iterations,
                                );
                                for reopened in &successors.reopened {
                                    run.completed_nodes.remove(reopened);
                                }
                                next_ready.extend(successors.nodes);
                            }
                        }
                    }
                    Err(node_error) => {
                        sink.emit(ExecutionEvent::NodeError {
                            run_id: run.run_id,
                            node: node.clone(),
                            error: node_error.clone(),
                        })
                        .await;
                        if failure.is_none() {
                            failure = Some((node, node_error));
                        }
                    }
                }
            }

            if let Some((node, node_error)) = failure {
                if node_error.is_type("cancelled") {
                    return self.finish_cancelled(run, run_started, &sink).await;
                }
                return self
                    .finish_failed(workflow, run, node, node_error, compensations, &sink)
                    .await;
            }

            if checkpoint_enabled {
                self.write_checkpoint(&run, &next_ready).await;
            }
            ready = next_ready;
        }

        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        if let Some(metrics) = &self.metrics {
            metrics.increment(format!("{}.completed", names::RUNS_BY_STATUS));
        }
        info!(run_id = %run.run_id, nodes = run.completed_nodes.len(), "run completed");
        sink.emit(ExecutionEvent::WorkflowComplete {
            run_id: run.run_id,
            state: run.state.clone(),
            duration: run_started.elapsed(),
        })
        .await;
        Ok(RunResult { run })
    }

    async fn suspend_run(
        &self,
        workflow: Arc<Workflow>,
        mut run: Run,
        frontier: Vec<String>,
        node_name: String,
        sink: &EventSink,
    ) -> Result<RunResult, EngineError> {
        let node = workflow
            .node(&node_name)
            .ok_or_else(|| EngineError::NotFound(format!("node {node_name}")))?;

        match &node.kind {
            NodeKind::Timer(config) => {
                let store = self.timers.as_ref().ok_or_else(|| {
                    EngineError::Configuration("timer nodes require a timer store".to_string())
                })?;
                let entry =
                    config.build_entry(run.run_id, &node_name, &run.state, self.clock.now())?;
                let timer_id = entry.id;
                store.enqueue(entry).await?;
                run.waiting_on = Some(WaitReason::Timer {
                    timer_id,
                    node: node_name.clone(),
                });
                debug!(run_id = %run.run_id, node = %node_name, %timer_id, "run waiting on timer");
            }
            NodeKind::Human(config) => {
                let manager = self.approvals.as_ref().ok_or_else(|| {
                    EngineError::Configuration(
                        "human nodes require an approval manager".to_string(),
                    )
                })?;
                let request =
                    config.build_request(workflow.id, run.run_id, &node_name, self.clock.now());
                let request_id = request.id;
                manager.open(request).await?;
                run.waiting_on = Some(WaitReason::Approval {
                    request_id,
                    node: node_name.clone(),
                });
                debug!(run_id = %run.run_id, node = %node_name, %request_id, "run waiting on approval");
            }
            _ => {
                return Err(EngineError::Configuration(format!(
                    "node {node_name} does not suspend"
                )))
            }
        }

        run.status = RunStatus::Waiting;
        // Durable suspension: always checkpoint when a store is attached.
        self.write_checkpoint(&run, &frontier).await;
        sink.emit(ExecutionEvent::WorkflowWaiting {
            run_id: run.run_id,
            node: node_name,
        })
        .await;
        Ok(RunResult { run })
    }

    async fn write_checkpoint(&self, run: &Run, frontier: &[String]) {
        if let Some(store) = &self.checkpoints {
            let checkpoint = Checkpoint::capture(run).with_frontier(frontier.iter().cloned());
            if let Err(e) = store.save(checkpoint).await {
                error!(run_id = %run.run_id, "checkpoint write failed: {e}");
            }
        }
    }

    async fn finish_cancelled(
        &self,
        mut run: Run,
        run_started: Instant,
        sink: &EventSink,
    ) -> Result<RunResult, EngineError> {
        run.status = RunStatus::Cancelled;
        run.error = Some(NodeError::cancelled());
        run.finished_at = Some(Utc::now());
        if let Some(metrics) = &self.metrics {
            metrics.increment(format!("{}.cancelled", names::RUNS_BY_STATUS));
        }
        info!(run_id = %run.run_id, "run cancelled");
        sink.emit(ExecutionEvent::WorkflowComplete {
            run_id: run.run_id,
            state: run.state.clone(),
            duration: run_started.elapsed(),
        })
        .await;
        Ok(RunResult { run })
    }

    async fn finish_failed(
        &self,
        _workflow: Arc<Workflow>,
        mut run: Run,
        node: String,
        mut node_error: NodeError,
        compensations: Arc<CompensationManager>,
        sink: &EventSink,
    ) -> Result<RunResult, EngineError> {
        // Roll back in reverse registration order. A compensation that
        // fails is logged and skipped; the run keeps the original error,
        // augmented with the rollback summary.
        let outcomes = compensations.compensate_all().await;
        if !outcomes.is_empty() {
            let summary: Vec<serde_json::Value> = outcomes
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "node": o.node,
                        "compensated": o.is_success(),
                    })
                })
                .collect();
            node_error = node_error
                .with_details(serde_json::json!({ "compensation": summary }));
        }

        if !node.is_empty() {
            error!(run_id = %run.run_id, node = %node, "run failed: {}", node_error.message);
        }
        run.status = RunStatus::Failed;
        run.error = Some(node_error);
        run.finished_at = Some(Utc::now());
        if let Some(metrics) = &self.metrics {
            metrics.increment(format!("{}.failed", names::RUNS_BY_STATUS));
        }

        // Persist the terminal state so restarts see the failure.
        self.write_checkpoint(&run, &[]).await;
        sink.emit(ExecutionEvent::WorkflowComplete {
            run_id: run.run_id,
            state: run.state.clone(),
            duration: run
                .duration()
                .unwrap_or_default(),
        })
        .await;
        Ok(RunResult { run })
    }
}

fn dedup(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
