//! Map-reduce over state-derived items
//!
//! Map applies an async mapper to every item under a concurrency cap,
//! with optional filter/transform, per-item timeout and retry, and a
//! choice between continue-on-error and fail-fast. Reduce folds the
//! per-item outcomes into an accumulator, either after all items finish
//! (batch) or as they complete (streaming).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::error::NodeError;
use crate::model::{NodeContext, RunState};
use crate::reliability::RetryPolicy;

/// Produces the items to map from the current state
pub type ItemsFn = Arc<dyn Fn(&RunState) -> Vec<serde_json::Value> + Send + Sync>;

/// Maps one item (with its position) to a result
pub type MapperFn = Arc<
    dyn Fn(serde_json::Value, usize) -> BoxFuture<'static, Result<serde_json::Value, NodeError>>
        + Send
        + Sync,
>;

/// Filters items before mapping
pub type ItemFilter = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Transforms items before mapping
pub type ItemTransform = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Observes map progress
pub type ProgressFn = Arc<dyn Fn(MapProgress) + Send + Sync>;

/// Outcome of mapping one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Item position in the mapped list
    pub index: usize,

    /// The (possibly transformed) input item
    pub input: serde_json::Value,

    /// Mapper result on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Terminal error on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,

    /// Attempts consumed
    pub attempts: u32,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl ItemOutcome {
    /// Whether the item mapped successfully
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Progress report emitted after each item settles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapProgress {
    /// Items being mapped
    pub total: usize,

    /// Items settled so far
    pub completed: usize,

    /// Successful items so far
    pub successful: usize,

    /// Failed items so far
    pub failed: usize,

    /// The most recently settled item
    pub latest: ItemOutcome,
}

/// Configuration record for a map node
#[derive(Clone)]
pub struct MapConfig {
    /// Item producer
    pub items: ItemsFn,

    /// Per-item mapper
    pub mapper: MapperFn,

    /// Optional pre-map filter
    pub filter: Option<ItemFilter>,

    /// Optional pre-map transform
    pub transform: Option<ItemTransform>,

    /// Concurrency cap
    pub concurrency: usize,

    /// Per-item attempt deadline
    pub item_timeout: Option<Duration>,

    /// Per-item retry policy
    pub item_retry: Option<RetryPolicy>,

    /// Record failed items and keep going (fail-fast when false)
    pub continue_on_error: bool,

    /// Progress observer
    pub on_progress: Option<ProgressFn>,

    /// State field the outcome list is written to (default `map_results`)
    pub output_key: String,
}

impl MapConfig {
    /// Create a map over `items` with `mapper`
    pub fn new<I, M, Fut>(items: I, mapper: M) -> Self
    where
        I: Fn(&RunState) -> Vec<serde_json::Value> + Send + Sync + 'static,
        M: Fn(serde_json::Value, usize) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, NodeError>> + Send + 'static,
    {
        Self {
            items: Arc::new(items),
            mapper: Arc::new(move |item, index| Box::pin(mapper(item, index))),
            filter: None,
            transform: None,
            concurrency: 4,
            item_timeout: None,
            item_retry: None,
            continue_on_error: false,
            on_progress: None,
            output_key: "map_results".to_string(),
        }
    }

    /// Set the concurrency cap
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Filter items before mapping
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Transform items before mapping
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Set the per-item attempt timeout
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    /// Set the per-item retry policy
    pub fn with_item_retry(mut self, policy: RetryPolicy) -> Self {
        self.item_retry = Some(policy);
        self
    }

    /// Record failures and keep going instead of failing fast
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Observe progress
    pub fn with_progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(MapProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    /// Set the output state field
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }
}

impl std::fmt::Debug for MapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapConfig")
            .field("concurrency", &self.concurrency)
            .field("item_timeout", &self.item_timeout)
            .field("continue_on_error", &self.continue_on_error)
            .field("output_key", &self.output_key)
            .finish()
    }
}

/// Folds an accumulator over item outcomes
pub type ReducerFn =
    Arc<dyn Fn(serde_json::Value, &ItemOutcome) -> serde_json::Value + Send + Sync>;

/// Produces the initial accumulator from state
pub type InitialFn = Arc<dyn Fn(&RunState) -> serde_json::Value + Send + Sync>;

/// Finalizes the accumulator
pub type FinalizeFn = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Configuration record for a reduce node
#[derive(Clone)]
pub struct ReduceConfig {
    /// Initial accumulator (may derive from state)
    pub initial: InitialFn,

    /// Fold step
    pub reducer: ReducerFn,

    /// Optional final transformation
    pub finalize: Option<FinalizeFn>,

    /// Fold only successful items (default true)
    pub success_only: bool,

    /// State field the outcomes are read from (default `map_results`)
    pub source_key: String,

    /// State field the accumulator is written to (default `reduce_result`)
    pub output_key: String,
}

impl ReduceConfig {
    /// Create a reduce with a fixed initial accumulator
    pub fn new<R>(initial: serde_json::Value, reducer: R) -> Self
    where
        R: Fn(serde_json::Value, &ItemOutcome) -> serde_json::Value + Send + Sync + 'static,
    {
        Self {
            initial: Arc::new(move |_| initial.clone()),
            reducer: Arc::new(reducer),
            finalize: None,
            success_only: true,
            source_key: "map_results".to_string(),
            output_key: "reduce_result".to_string(),
        }
    }

    /// Derive the initial accumulator from state
    pub fn with_initial_from_state<F>(mut self, initial: F) -> Self
    where
        F: Fn(&RunState) -> serde_json::Value + Send + Sync + 'static,
    {
        self.initial = Arc::new(initial);
        self
    }

    /// Set the finalizer
    pub fn with_finalize<F>(mut self, finalize: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.finalize = Some(Arc::new(finalize));
        self
    }

    /// Include failed items in the fold
    pub fn include_failures(mut self) -> Self {
        self.success_only = false;
        self
    }

    /// Set the source state field
    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = key.into();
        self
    }

    /// Set the output state field
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }
}

impl std::fmt::Debug for ReduceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceConfig")
            .field("success_only", &self.success_only)
            .field("source_key", &self.source_key)
            .field("output_key", &self.output_key)
            .finish()
    }
}

/// Map followed by reduce in one node
#[derive(Debug, Clone)]
pub struct MapReduceConfig {
    /// The map stage
    pub map: MapConfig,

    /// The reduce stage
    pub reduce: ReduceConfig,

    /// Fold items as they complete instead of after the map finishes
    pub streaming: bool,
}

impl MapReduceConfig {
    /// Create a batch map-reduce
    pub fn new(map: MapConfig, reduce: ReduceConfig) -> Self {
        Self {
            map,
            reduce,
            streaming: false,
        }
    }

    /// Fold in completion order as items settle
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }
}

/// Run the map stage, returning outcomes indexed by item position
///
/// Fail-fast (the default) stops dispatching after the first failure;
/// items never started settle with a `skipped` error. With
/// `continue_on_error` every item runs and failures are recorded.
pub async fn run_map(config: &MapConfig, ctx: &NodeContext) -> Result<Vec<ItemOutcome>, NodeError> {
    let (outcomes, _) = run_map_streaming(config, ctx, |_| {}).await?;
    Ok(outcomes)
}

/// Run the map stage, invoking `on_settled` as each item settles
///
/// Returns outcomes sorted by item position plus the count of successes.
pub async fn run_map_streaming<F>(
    config: &MapConfig,
    ctx: &NodeContext,
    mut on_settled: F,
) -> Result<(Vec<ItemOutcome>, usize), NodeError>
where
    F: FnMut(&ItemOutcome),
{
    let items: Vec<serde_json::Value> = (config.items)(&ctx.state)
        .into_iter()
        .filter(|item| config.filter.as_ref().map_or(true, |f| f(item)))
        .map(|item| match &config.transform {
            Some(t) => t(item),
            None => item,
        })
        .collect();

    let total = items.len();
    if total == 0 {
        return Ok((vec![], 0));
    }
    debug!(total, concurrency = config.concurrency, "map started");

    let semaphore = Arc::new(Semaphore::new(config.concurrency));
    let abort = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(Mutex::new((0usize, 0usize, 0usize)));
    let (tx, mut rx) = mpsc::channel::<ItemOutcome>(total);

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let abort = Arc::clone(&abort);
        let tx = tx.clone();
        let mapper = Arc::clone(&config.mapper);
        let retry = config.item_retry.clone();
        let item_timeout = config.item_timeout;
        let continue_on_error = config.continue_on_error;
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");

            if cancel.is_cancelled() || (!continue_on_error && abort.load(Ordering::SeqCst)) {
                let _ = tx
                    .send(ItemOutcome {
                        index,
                        input: item,
                        output: None,
                        error: Some(
                            NodeError::non_retryable("skipped after earlier failure")
                                .with_type("skipped"),
                        ),
                        attempts: 0,
                        duration_ms: 0,
                    })
                    .await;
                return;
            }

            let started = Instant::now();
            let mut attempt = 1u32;
            let outcome = loop {
                let call = mapper(item.clone(), index);
                let result = match item_timeout {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(NodeError::timeout(format!(
                            "item {index} exceeded {}ms",
                            limit.as_millis()
                        ))),
                    },
                    None => call.await,
                };

                match result {
                    Ok(output) => {
                        break ItemOutcome {
                            index,
                            input: item,
                            output: Some(output),
                            error: None,
                            attempts: attempt,
                            duration_ms: started.elapsed().as_millis() as u64,
                        };
                    }
                    Err(error) => {
                        let retry_allowed = retry.as_ref().is_some_and(|policy| {
                            error.retryable
                                && policy.should_retry(error.error_type.as_deref())
                                && policy.has_attempts_remaining(attempt)
                        });
                        if !retry_allowed {
                            if !continue_on_error {
                                abort.store(true, Ordering::SeqCst);
                            }
                            break ItemOutcome {
                                index,
                                input: item,
                                output: None,
                                error: Some(error),
                                attempts: attempt,
                                duration_ms: started.elapsed().as_millis() as u64,
                            };
                        }
                        attempt += 1;
                        let delay = retry
                            .as_ref()
                            .map(|policy| policy.delay_for_attempt(attempt))
                            .unwrap_or_default();
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            };

            let _ = tx.send(outcome).await;
        });
    }
    drop(tx);

    let mut outcomes: Vec<Option<ItemOutcome>> = (0..total).map(|_| None).collect();
    let mut successful = 0usize;
    let mut first_error: Option<NodeError> = None;

    while let Some(outcome) = rx.recv().await {
        {
            let mut counters = progress.lock();
            counters.0 += 1;
            if outcome.is_success() {
                counters.1 += 1;
                successful += 1;
            } else {
                counters.2 += 1;
            }
            if let Some(on_progress) = &config.on_progress {
                on_progress(MapProgress {
                    total,
                    completed: counters.0,
                    successful: counters.1,
                    failed: counters.2,
                    latest: outcome.clone(),
                });
            }
        }

        if !outcome.is_success()
            && first_error.is_none()
            && !outcome
                .error
                .as_ref()
                .is_some_and(|e| e.is_type("skipped"))
        {
            first_error = outcome.error.clone();
        }
        on_settled(&outcome);
        let index = outcome.index;
        outcomes[index] = Some(outcome);
    }

    let outcomes: Vec<ItemOutcome> = outcomes.into_iter().flatten().collect();

    if !config.continue_on_error {
        if let Some(error) = first_error {
            return Err(error);
        }
    }
    Ok((outcomes, successful))
}

/// Fold item outcomes into an accumulator (batch reduce)
pub fn run_reduce(
    config: &ReduceConfig,
    state: &RunState,
    outcomes: &[ItemOutcome],
) -> serde_json::Value {
    let mut acc = (config.initial)(state);
    for outcome in outcomes {
        if config.success_only && !outcome.is_success() {
            continue;
        }
        acc = (config.reducer)(acc, outcome);
    }
    match &config.finalize {
        Some(finalize) => finalize(acc),
        None => acc,
    }
}

/// Run map and reduce together
///
/// In streaming mode the fold happens in completion order as items
/// settle; in batch mode the fold runs after every item has finished.
/// Returns (accumulator, outcomes).
pub async fn run_map_reduce(
    config: &MapReduceConfig,
    ctx: &NodeContext,
) -> Result<(serde_json::Value, Vec<ItemOutcome>), NodeError> {
    if config.streaming {
        let mut acc = (config.reduce.initial)(&ctx.state);
        let reducer = Arc::clone(&config.reduce.reducer);
        let success_only = config.reduce.success_only;

        let (outcomes, _) = run_map_streaming(&config.map, ctx, |outcome| {
            if !success_only || outcome.is_success() {
                let previous = std::mem::replace(&mut acc, serde_json::Value::Null);
                acc = reducer(previous, outcome);
            }
        })
        .await?;

        let acc = match &config.reduce.finalize {
            Some(finalize) => finalize(acc),
            None => acc,
        };
        Ok((acc, outcomes))
    } else {
        let outcomes = run_map(&config.map, ctx).await?;
        let acc = run_reduce(&config.reduce, &ctx.state, &outcomes);
        Ok((acc, outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx_with_items(items: serde_json::Value) -> NodeContext {
        let mut state = RunState::new();
        state.set("items", items);
        NodeContext::new(Uuid::now_v7(), Uuid::now_v7(), "wf", "map", state)
    }

    fn items_from_state(state: &RunState) -> Vec<serde_json::Value> {
        state
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_map_doubles_items() {
        let config = MapConfig::new(items_from_state, |item, _| async move {
            Ok(json!(item.as_i64().unwrap() * 2))
        })
        .with_concurrency(3);
        let ctx = ctx_with_items(json!([1, 2, 3, 4]));

        let outcomes = run_map(&config, &ctx).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        let doubled: Vec<i64> = outcomes
            .iter()
            .map(|o| o.output.as_ref().unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(doubled, vec![2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn test_map_filter_and_transform() {
        let config = MapConfig::new(items_from_state, |item, _| async move { Ok(item) })
            .with_filter(|item| item.as_i64().unwrap() % 2 == 1)
            .with_transform(|item| json!(item.as_i64().unwrap() + 10));
        let ctx = ctx_with_items(json!([1, 2, 3, 4, 5]));

        let outcomes = run_map(&config, &ctx).await.unwrap();
        let results: Vec<i64> = outcomes
            .iter()
            .map(|o| o.output.as_ref().unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(results, vec![11, 13, 15]);
    }

    #[tokio::test]
    async fn test_map_continue_on_error_records_failures() {
        let config = MapConfig::new(items_from_state, |item, _| async move {
            let n = item.as_i64().unwrap();
            if n % 2 == 0 {
                Err(NodeError::non_retryable(format!("even input {n}")))
            } else {
                Ok(json!(n))
            }
        })
        .with_concurrency(3)
        .continue_on_error(true);
        let ctx = ctx_with_items(json!([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));

        let outcomes = run_map(&config, &ctx).await.unwrap();
        assert_eq!(outcomes.len(), 10);
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 5);
        assert_eq!(outcomes.iter().filter(|o| !o.is_success()).count(), 5);
    }

    #[tokio::test]
    async fn test_map_fail_fast_returns_error() {
        let config = MapConfig::new(items_from_state, |item, _| async move {
            if item.as_i64().unwrap() == 2 {
                Err(NodeError::non_retryable("boom"))
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(item)
            }
        })
        .with_concurrency(1);
        let ctx = ctx_with_items(json!([1, 2, 3, 4]));

        let result = run_map(&config, &ctx).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().message, "boom");
    }

    #[tokio::test]
    async fn test_map_item_retry() {
        let attempts = Arc::new(Mutex::new(0u32));
        let attempts_clone = attempts.clone();

        let config = MapConfig::new(items_from_state, move |item, _| {
            let attempts = attempts_clone.clone();
            async move {
                let n = {
                    let mut guard = attempts.lock();
                    *guard += 1;
                    *guard
                };
                if n < 3 {
                    Err(NodeError::retryable("transient"))
                } else {
                    Ok(item)
                }
            }
        })
        .with_item_retry(RetryPolicy::fixed(Duration::from_millis(1), 5));
        let ctx = ctx_with_items(json!([1]));

        let outcomes = run_map(&config, &ctx).await.unwrap();
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_map_item_timeout() {
        let config = MapConfig::new(items_from_state, |item, _| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(item)
        })
        .with_item_timeout(Duration::from_millis(10))
        .continue_on_error(true);
        let ctx = ctx_with_items(json!([1]));

        let outcomes = run_map(&config, &ctx).await.unwrap();
        assert!(!outcomes[0].is_success());
        assert!(outcomes[0].error.as_ref().unwrap().is_type("timeout"));
    }

    #[tokio::test]
    async fn test_map_progress_reports() {
        let reports: Arc<Mutex<Vec<MapProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();

        let config = MapConfig::new(items_from_state, |item, _| async move { Ok(item) })
            .with_progress(move |progress| reports_clone.lock().push(progress));
        let ctx = ctx_with_items(json!([1, 2, 3]));

        run_map(&config, &ctx).await.unwrap();

        let reports = reports.lock();
        assert_eq!(reports.len(), 3);
        let last = reports.last().unwrap();
        assert_eq!(last.total, 3);
        assert_eq!(last.completed, 3);
        assert_eq!(last.successful, 3);
        assert_eq!(last.failed, 0);
    }

    #[tokio::test]
    async fn test_batch_reduce_sums_successes() {
        let map = MapConfig::new(items_from_state, |item, _| async move {
            let n = item.as_i64().unwrap();
            if n == 3 {
                Err(NodeError::non_retryable("skip me"))
            } else {
                Ok(json!(n))
            }
        })
        .continue_on_error(true);
        let reduce = ReduceConfig::new(json!(0), |acc, outcome| {
            json!(acc.as_i64().unwrap() + outcome.output.as_ref().unwrap().as_i64().unwrap())
        });

        let ctx = ctx_with_items(json!([1, 2, 3, 4]));
        let (total, outcomes) = run_map_reduce(&MapReduceConfig::new(map, reduce), &ctx)
            .await
            .unwrap();

        assert_eq!(total, json!(7)); // 1 + 2 + 4
        assert_eq!(outcomes.len(), 4);
    }

    #[tokio::test]
    async fn test_streaming_reduce_folds_on_completion() {
        let map = MapConfig::new(items_from_state, |item, _| async move { Ok(item) })
            .with_concurrency(4);
        let reduce = ReduceConfig::new(json!(0), |acc, outcome| {
            json!(acc.as_i64().unwrap() + outcome.output.as_ref().unwrap().as_i64().unwrap())
        })
        .with_finalize(|acc| json!({"sum": acc}));

        let ctx = ctx_with_items(json!([1, 2, 3, 4, 5]));
        let (result, _) = run_map_reduce(&MapReduceConfig::new(map, reduce).streaming(), &ctx)
            .await
            .unwrap();

        assert_eq!(result, json!({"sum": 15}));
    }

    #[tokio::test]
    async fn test_reduce_with_initial_from_state() {
        let mut state = RunState::new();
        state.set("base", json!(100));
        let config = ReduceConfig::new(json!(0), |acc, outcome| {
            json!(acc.as_i64().unwrap() + outcome.output.as_ref().unwrap().as_i64().unwrap())
        })
        .with_initial_from_state(|s: &RunState| s.get("base").cloned().unwrap_or(json!(0)));

        let outcomes = vec![ItemOutcome {
            index: 0,
            input: json!(1),
            output: Some(json!(5)),
            error: None,
            attempts: 1,
            duration_ms: 0,
        }];
        assert_eq!(run_reduce(&config, &state, &outcomes), json!(105));
    }

    #[tokio::test]
    async fn test_empty_items() {
        let config = MapConfig::new(items_from_state, |item, _| async move { Ok(item) });
        let ctx = ctx_with_items(json!([]));
        let outcomes = run_map(&config, &ctx).await.unwrap();
        assert!(outcomes.is_empty());
    }
}
