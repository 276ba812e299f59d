//! Run manager
//!
//! Owns admission: enqueued runs wait in a priority queue and dispatch
//! when a slot under the global concurrency cap frees up. The run store
//! is the source of truth for lifecycles and restart recovery; orphaned
//! runs are resumed from their last checkpoint or failed per policy.

mod maintenance;
mod queue;
mod store;

pub use maintenance::{MaintenanceConfig, MaintenanceReport, MaintenanceScheduler};
pub use queue::{QueuedRun, RunQueue};
pub use store::{InMemoryRunStore, RunFilter, RunStats, RunStore};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use windlass_observability::TraceContext;

use crate::error::{EngineError, NodeError};
use crate::executor::{ExecuteOptions, Executor};
use crate::model::{Run, RunStatus, StatePatch, Workflow};
use crate::reliability::Pagination;
use crate::timer::{TimerManager, TimerManagerConfig, TimerStore};

/// What to do with runs found `running` at startup with no executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Resume from the last checkpoint; fail when none exists
    Resume,

    /// Mark the run failed with an `orphaned` error
    Fail,
}

/// Run manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunManagerConfig {
    /// Global concurrency cap (default 4)
    pub max_concurrent_runs: usize,

    /// Dispatcher wake interval (default 50ms)
    #[serde(with = "duration_millis")]
    pub dispatch_interval: Duration,

    /// Orphan recovery policy (default resume)
    pub orphan_policy: OrphanPolicy,

    /// Graceful shutdown drain timeout (default 30s)
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for RunManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            dispatch_interval: Duration::from_millis(50),
            orphan_policy: OrphanPolicy::Resume,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RunManagerConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global concurrency cap
    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max.max(1);
        self
    }

    /// Set the orphan policy
    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    /// Set the shutdown drain timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Outcome of startup recovery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Runs re-queued for resumption
    pub resumed: usize,

    /// Runs failed as orphaned
    pub orphaned: usize,
}

/// Shared dispatch state, cloned into background tasks
#[derive(Clone)]
struct Dispatcher {
    executor: Arc<Executor>,
    store: Arc<dyn RunStore>,
    queue: Arc<RunQueue>,
    workflows: Arc<RwLock<HashMap<String, Arc<Workflow>>>>,
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    wake: Arc<Notify>,
}

impl Dispatcher {
    /// Dispatch queued runs while slots are free
    fn dispatch_available(&self) {
        loop {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                break;
            };
            let Some(queued) = self.queue.pop() else {
                drop(permit);
                break;
            };

            let dispatcher = self.clone();
            self.active.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.run_one(queued.run_id).await {
                    error!(run_id = %queued.run_id, "run dispatch failed: {e}");
                }
                dispatcher.active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                dispatcher.wake.notify_one();
            });
        }
    }

    /// Execute (or resume) one dequeued run
    async fn run_one(&self, run_id: Uuid) -> Result<(), EngineError> {
        let Some(mut run) = self.store.get(run_id).await? else {
            return Err(EngineError::NotFound(format!("run {run_id}")));
        };
        if run.status.is_terminal() {
            debug!(%run_id, "skipping terminal run");
            return Ok(());
        }
        let workflow = self.workflows.read().get(&run.workflow_name).cloned();
        let Some(workflow) = workflow else {
            run.status = RunStatus::Failed;
            run.error = Some(
                NodeError::non_retryable(format!(
                    "workflow {} is not registered",
                    run.workflow_name
                ))
                .with_type("unregistered_workflow"),
            );
            run.finished_at = Some(Utc::now());
            self.store.update(run).await?;
            return Ok(());
        };

        run.status = RunStatus::Running;
        run.started_at.get_or_insert_with(Utc::now);
        self.store.update(run.clone()).await?;

        // Continue the trace a trigger carried over, when present.
        let mut options = ExecuteOptions::new();
        if let Some(trace) = run
            .state
            .get_str("traceparent")
            .and_then(TraceContext::from_traceparent)
        {
            options = options.with_trace(trace);
        }

        let has_checkpoint = match &self.executor.checkpoints {
            Some(store) => store.latest_for_run(run_id).await?.is_some(),
            None => false,
        };

        let result = if has_checkpoint {
            self.executor
                .resume_latest(workflow, run_id, options)
                .await?
        } else {
            self.executor.execute_run(workflow, run, options).await?
        };

        self.store.update(result.run).await?;
        Ok(())
    }

    /// Re-queue a suspended run
    async fn resume_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        let Some(run) = self.store.get(run_id).await? else {
            return Err(EngineError::NotFound(format!("run {run_id}")));
        };
        if run.status.is_terminal() {
            return Ok(());
        }
        self.queue.push(run_id, run.priority);
        self.wake.notify_one();
        debug!(%run_id, "run re-queued for resumption");
        Ok(())
    }
}

/// Admits and dispatches runs under a global concurrency cap
///
/// # Example
///
/// ```ignore
/// let manager = Arc::new(RunManager::new(executor, store, config));
/// manager.register_workflow(workflow);
/// manager.start();
///
/// let run_id = manager.enqueue("order_pipeline", Some(input), 5).await?;
/// ```
pub struct RunManager {
    dispatcher: Dispatcher,
    config: RunManagerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RunManager {
    /// Create a manager over an executor and run store
    pub fn new(
        executor: Arc<Executor>,
        store: Arc<dyn RunStore>,
        config: RunManagerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            dispatcher: Dispatcher {
                executor,
                store,
                queue: Arc::new(RunQueue::new()),
                workflows: Arc::new(RwLock::new(HashMap::new())),
                slots: Arc::new(Semaphore::new(config.max_concurrent_runs)),
                active: Arc::new(AtomicUsize::new(0)),
                wake: Arc::new(Notify::new()),
            },
            config,
            shutdown_tx,
            shutdown_rx,
            dispatch_handle: Mutex::new(None),
        }
    }

    /// Register a workflow definition by name
    pub fn register_workflow(&self, workflow: Arc<Workflow>) {
        info!(workflow = %workflow.name, "registered workflow");
        self.dispatcher
            .workflows
            .write()
            .insert(workflow.name.clone(), workflow);
    }

    /// Look up a registered workflow
    pub fn workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.dispatcher.workflows.read().get(name).cloned()
    }

    /// The run store
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.dispatcher.store
    }

    /// The executor
    pub fn executor(&self) -> &Arc<Executor> {
        &self.dispatcher.executor
    }

    /// Runs currently executing
    pub fn active_runs(&self) -> usize {
        self.dispatcher.active.load(Ordering::SeqCst)
    }

    /// Runs waiting for a slot
    pub fn queued_runs(&self) -> usize {
        self.dispatcher.queue.len()
    }

    /// Enqueue a run of a registered workflow
    #[instrument(skip(self, input))]
    pub async fn enqueue(
        &self,
        workflow_name: &str,
        input: Option<StatePatch>,
        priority: i32,
    ) -> Result<Uuid, EngineError> {
        let workflow = self
            .workflow(workflow_name)
            .ok_or_else(|| EngineError::NotFound(format!("workflow {workflow_name}")))?;

        let mut run = Run::new(&workflow);
        run.priority = priority;
        if let Some(input) = input {
            run.state.merge(input);
        }
        let run_id = run.run_id;

        self.dispatcher.store.create(run).await?;
        self.dispatcher.queue.push(run_id, priority);
        self.dispatcher.wake.notify_one();
        debug!(%run_id, priority, "run enqueued");
        Ok(run_id)
    }

    /// Start the dispatch loop
    pub fn start(&self) {
        let dispatcher = self.dispatcher.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.dispatch_interval;
        let cap = self.config.max_concurrent_runs;

        let handle = tokio::spawn(async move {
            info!(cap, "run manager started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = dispatcher.wake.notified() => {}
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        debug!("run manager: shutdown requested");
                        break;
                    }
                }
                dispatcher.dispatch_available();
            }
        });

        *self.dispatch_handle.lock() = Some(handle);
    }

    /// Resume a suspended run (timer fired or approval arrived)
    ///
    /// Re-queues the run so it competes for a slot like any other.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        self.dispatcher.resume_run(run_id).await
    }

    /// Build a timer manager whose fired timers resume runs here
    pub fn wire_timer_manager(
        &self,
        store: Arc<dyn TimerStore>,
        config: TimerManagerConfig,
    ) -> TimerManager {
        let dispatcher = self.dispatcher.clone();
        TimerManager::new(store, Arc::clone(&self.dispatcher.executor.clock), config).on_fire(
            move |entry| {
                let dispatcher = dispatcher.clone();
                async move {
                    if let Err(e) = dispatcher.resume_run(entry.run_id).await {
                        warn!(run_id = %entry.run_id, "timer resume failed: {e}");
                    }
                }
            },
        )
    }

    /// Recover runs left `running` by a dead executor
    ///
    /// Under [`OrphanPolicy::Resume`], runs with a checkpoint re-queue
    /// for resumption; runs without one (and every orphan under
    /// [`OrphanPolicy::Fail`]) are marked failed with `orphaned`.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport, EngineError> {
        let running = self
            .dispatcher
            .store
            .list(
                RunFilter::status(RunStatus::Running),
                Pagination {
                    offset: 0,
                    limit: u32::MAX,
                },
            )
            .await?;

        let mut report = RecoveryReport::default();
        for mut run in running {
            let has_checkpoint = match &self.dispatcher.executor.checkpoints {
                Some(store) => store.latest_for_run(run.run_id).await?.is_some(),
                None => false,
            };

            if self.config.orphan_policy == OrphanPolicy::Resume && has_checkpoint {
                self.dispatcher.queue.push(run.run_id, run.priority);
                report.resumed += 1;
                info!(run_id = %run.run_id, "orphaned run queued for resumption");
            } else {
                run.status = RunStatus::Failed;
                run.error = Some(
                    NodeError::non_retryable("run orphaned by executor restart")
                        .with_type("orphaned"),
                );
                run.finished_at = Some(Utc::now());
                self.dispatcher.store.update(run).await?;
                report.orphaned += 1;
            }
        }
        if report.resumed > 0 {
            self.dispatcher.wake.notify_one();
        }
        Ok(report)
    }

    /// Pull a dead-letter entry back into the queue as a fresh run
    pub async fn requeue_dead_letter(&self, dlq_id: Uuid) -> Result<Uuid, EngineError> {
        let dlq = self.dispatcher.executor.dlq.as_ref().ok_or_else(|| {
            EngineError::Configuration("requeue requires a dead-letter queue".to_string())
        })?;
        let entry = dlq.requeue(dlq_id).await?;
        let input = match entry.input {
            serde_json::Value::Object(fields) => Some(fields),
            _ => None,
        };
        self.enqueue(&entry.workflow_name, input, 0).await
    }

    /// Query a run
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        self.dispatcher.store.get(run_id).await
    }

    /// List runs
    pub async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<Run>, EngineError> {
        self.dispatcher.store.list(filter, pagination).await
    }

    /// Aggregate run stats
    pub async fn stats(
        &self,
        range: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
    ) -> Result<RunStats, EngineError> {
        self.dispatcher.store.stats(range).await
    }

    /// Stop the dispatch loop, draining active runs
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.dispatch_handle.lock().take() {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.dispatcher.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.dispatcher.active.load(Ordering::SeqCst),
                    "shutdown drain timed out"
                );
                return Err(EngineError::store("shutdown drain timed out"));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!("run manager stopped");
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
    use crate::executor::ExecutorConfig;
    use crate::model::{NodeDef, NodeOutput};
    use serde_json::json;

    fn simple_workflow(name: &str) -> Arc<Workflow> {
        Workflow::builder(name)
            .add_node(NodeDef::function("work", |ctx| async move {
                let x = ctx.state.get_i64("x").unwrap_or(0);
                Ok(NodeOutput::empty().set("x", json!(x + 1)))
            }))
            .entry_point("work")
            .build()
            .unwrap()
    }

    fn manager() -> Arc<RunManager> {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()));
        Arc::new(RunManager::new(
            executor,
            Arc::new(InMemoryRunStore::new()),
            RunManagerConfig::default(),
        ))
    }

    async fn wait_for_terminal(manager: &RunManager, run_id: Uuid) -> Run {
        for _ in 0..200 {
            if let Some(run) = manager.get_run(run_id).await.unwrap() {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not reach a terminal status");
    }

    #[tokio::test]
    async fn test_enqueue_requires_registered_workflow() {
        let manager = manager();
        let result = manager.enqueue("ghost", None, 0).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_enqueue_and_execute() {
        let manager = manager();
        manager.register_workflow(simple_workflow("simple"));
        manager.start();

        let run_id = manager
            .enqueue("simple", Some(crate::model::patch([("x", json!(10))])), 0)
            .await
            .unwrap();

        let run = wait_for_terminal(&manager, run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.state.get_i64("x"), Some(11));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()));
        let manager = Arc::new(RunManager::new(
            executor,
            Arc::new(InMemoryRunStore::new()),
            RunManagerConfig::default().with_max_concurrent_runs(1),
        ));

        let workflow = Workflow::builder("slow")
            .add_node(NodeDef::function("work", |_| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(NodeOutput::empty())
            }))
            .entry_point("work")
            .build()
            .unwrap();
        manager.register_workflow(workflow);
        manager.start();

        let a = manager.enqueue("slow", None, 0).await.unwrap();
        let b = manager.enqueue("slow", None, 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.active_runs() <= 1);

        wait_for_terminal(&manager, a).await;
        wait_for_terminal(&manager, b).await;
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_dispatch_order() {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()));
        let manager = Arc::new(RunManager::new(
            executor,
            Arc::new(InMemoryRunStore::new()),
            RunManagerConfig::default().with_max_concurrent_runs(1),
        ));

        let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let workflow = Workflow::builder("ordered")
            .add_node(NodeDef::function("work", move |ctx| {
                let order = order_clone.clone();
                async move {
                    order.lock().push(ctx.state.get_i64("tag").unwrap_or(-1));
                    Ok(NodeOutput::empty())
                }
            }))
            .entry_point("work")
            .build()
            .unwrap();
        manager.register_workflow(workflow);

        // Enqueue before starting so the dispatcher sees all three at once.
        let low = manager
            .enqueue("ordered", Some(crate::model::patch([("tag", json!(1))])), 1)
            .await
            .unwrap();
        let high = manager
            .enqueue("ordered", Some(crate::model::patch([("tag", json!(3))])), 10)
            .await
            .unwrap();
        let mid = manager
            .enqueue("ordered", Some(crate::model::patch([("tag", json!(2))])), 5)
            .await
            .unwrap();

        manager.start();
        for run_id in [low, high, mid] {
            wait_for_terminal(&manager, run_id).await;
        }
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_orphans_fail_policy() {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()));
        let store = Arc::new(InMemoryRunStore::new());
        let manager = Arc::new(RunManager::new(
            executor,
            store.clone(),
            RunManagerConfig::default().with_orphan_policy(OrphanPolicy::Fail),
        ));
        manager.register_workflow(simple_workflow("simple"));

        let workflow = manager.workflow("simple").unwrap();
        let mut run = Run::new(&workflow);
        run.status = RunStatus::Running;
        let run_id = run.run_id;
        store.create(run).await.unwrap();

        let report = manager.recover_orphans().await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.resumed, 0);

        let failed = store.get(run_id).await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.error.unwrap().is_type("orphaned"));
    }

    #[tokio::test]
    async fn test_recover_orphans_resume_policy() {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let executor = Arc::new(
            Executor::new(ExecutorConfig::default()).with_checkpoint_store(checkpoints.clone()),
        );
        let store = Arc::new(InMemoryRunStore::new());
        let manager = Arc::new(RunManager::new(
            executor,
            store.clone(),
            RunManagerConfig::default(),
        ));
        manager.register_workflow(simple_workflow("simple"));

        let workflow = manager.workflow("simple").unwrap();
        let mut run = Run::new(&workflow);
        run.status = RunStatus::Running;
        let run_id = run.run_id;
        checkpoints
            .save(Checkpoint::capture(&run).with_frontier(["work"]))
            .await
            .unwrap();
        store.create(run).await.unwrap();

        let report = manager.recover_orphans().await.unwrap();
        assert_eq!(report.resumed, 1);

        manager.start();
        let run = wait_for_terminal(&manager, run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        manager.shutdown().await.unwrap();
    }
}
