//! Subworkflow composition
//!
//! A subworkflow node runs another workflow as a child of the current
//! run, inheriting trace context and a depth counter. On top of the
//! single-child node, this module provides the parallel composition
//! patterns: parallel set, scatter-gather, race, and fallback.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{EngineError, NodeError};
use crate::executor::{ExecuteOptions, Executor};
use crate::model::{NodeContext, NodeOutput, RunResult, RunState, StatePatch, Workflow};

/// Default nesting limit for subworkflows
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// How a child failure affects the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubworkflowErrorStrategy {
    /// The child's error fails the parent node
    Propagate,

    /// The child's error becomes an error-valued result
    Ignore,

    /// The child's error fails the parent node and explicitly requests
    /// parent compensation
    Compensate,
}

/// Maps the parent state to a child input patch
pub type InputMapper = Arc<dyn Fn(&RunState) -> StatePatch + Send + Sync>;

/// Configuration record for a subworkflow node
#[derive(Clone)]
pub struct SubworkflowConfig {
    /// The child workflow
    pub workflow: Arc<Workflow>,

    /// Input derivation from the parent state (child initial state only
    /// when unset)
    pub input: Option<InputMapper>,

    /// State field the child's final state is written to (default `child`)
    pub output_key: String,

    /// Failure handling
    pub error_strategy: SubworkflowErrorStrategy,

    /// Nesting limit
    pub max_depth: u32,
}

impl SubworkflowConfig {
    /// Create a config for the given child workflow
    pub fn new(workflow: Arc<Workflow>) -> Self {
        Self {
            workflow,
            input: None,
            output_key: "child".to_string(),
            error_strategy: SubworkflowErrorStrategy::Propagate,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Derive the child input from the parent state
    pub fn with_input<F>(mut self, input: F) -> Self
    where
        F: Fn(&RunState) -> StatePatch + Send + Sync + 'static,
    {
        self.input = Some(Arc::new(input));
        self
    }

    /// Set the output state field
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = key.into();
        self
    }

    /// Set the error strategy
    pub fn with_error_strategy(mut self, strategy: SubworkflowErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    /// Set the nesting limit
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }
}

impl std::fmt::Debug for SubworkflowConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubworkflowConfig")
            .field("workflow", &self.workflow.name)
            .field("output_key", &self.output_key)
            .field("error_strategy", &self.error_strategy)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

/// Run a child workflow for a subworkflow node
///
/// The child inherits the parent's trace context and cancellation token
/// and carries `depth + 1`; exceeding the configured depth limit fails
/// with `max_depth_exceeded` without executing.
pub async fn run_subworkflow(
    executor: &Executor,
    ctx: &NodeContext,
    config: &SubworkflowConfig,
) -> Result<NodeOutput, NodeError> {
    let depth = ctx.depth + 1;
    if depth > config.max_depth {
        return Err(NodeError::non_retryable(format!(
            "subworkflow depth {depth} exceeds limit {}",
            config.max_depth
        ))
        .with_type("max_depth_exceeded"));
    }

    let mut options = ExecuteOptions::new()
        .with_depth(depth)
        .with_cancel(ctx.cancel.clone());
    if let Some(trace) = ctx.trace {
        options = options.with_trace(trace);
    }
    if let Some(mapper) = &config.input {
        options = options.with_input(mapper(&ctx.state));
    }

    debug!(child = %config.workflow.name, depth, "running subworkflow");
    let result = executor
        .execute_boxed(Arc::clone(&config.workflow), options)
        .await
        .map_err(|e| NodeError::non_retryable(e.to_string()))?;

    if result.is_success() {
        let child_state = result.state().to_value();
        return Ok(NodeOutput::empty()
            .set(config.output_key.clone(), child_state.clone())
            .with_value(child_state));
    }

    let child_error = result
        .error()
        .cloned()
        .unwrap_or_else(|| NodeError::non_retryable("subworkflow failed"));

    match config.error_strategy {
        SubworkflowErrorStrategy::Propagate => Err(NodeError::non_retryable(format!(
            "subworkflow {} failed: {}",
            config.workflow.name, child_error.message
        ))
        .with_type("subworkflow_failed")),
        SubworkflowErrorStrategy::Compensate => Err(NodeError::non_retryable(format!(
            "subworkflow {} failed: {}",
            config.workflow.name, child_error.message
        ))
        .with_type("subworkflow_compensate")),
        SubworkflowErrorStrategy::Ignore => {
            let value = serde_json::json!({ "error": child_error });
            Ok(NodeOutput::empty()
                .set(config.output_key.clone(), value.clone())
                .with_value(value))
        }
    }
}

/// One child in a parallel composition
#[derive(Clone)]
pub struct ChildSpec {
    /// The child workflow
    pub workflow: Arc<Workflow>,

    /// Input patch for the child
    pub input: StatePatch,
}

impl ChildSpec {
    /// Create a child with no extra input
    pub fn new(workflow: Arc<Workflow>) -> Self {
        Self {
            workflow,
            input: StatePatch::new(),
        }
    }

    /// Set the child's input patch
    pub fn with_input(mut self, input: StatePatch) -> Self {
        self.input = input;
        self
    }
}

fn child_options(ctx: &NodeContext, input: StatePatch, cancel: CancelToken) -> ExecuteOptions {
    let mut options = ExecuteOptions::new()
        .with_depth(ctx.depth + 1)
        .with_cancel(cancel)
        .with_input(input);
    if let Some(trace) = ctx.trace {
        options = options.with_trace(trace);
    }
    options
}

/// Run all children concurrently, collecting every result in order
pub async fn parallel_subworkflows(
    executor: &Executor,
    ctx: &NodeContext,
    children: Vec<ChildSpec>,
) -> Vec<Result<RunResult, EngineError>> {
    let futures = children.into_iter().map(|child| {
        let options = child_options(ctx, child.input, ctx.cancel.clone());
        executor.execute(child.workflow, options)
    });
    futures::future::join_all(futures).await
}

/// Distribute items across children of the same workflow, then collect
///
/// Each item becomes one child run with the item under `item_key` (plus
/// its position under `item_index`).
pub async fn scatter_gather(
    executor: &Executor,
    ctx: &NodeContext,
    workflow: Arc<Workflow>,
    items: Vec<serde_json::Value>,
    item_key: &str,
) -> Vec<Result<RunResult, EngineError>> {
    let children = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let mut input = StatePatch::new();
            input.insert(item_key.to_string(), item);
            input.insert("item_index".to_string(), serde_json::json!(index));
            ChildSpec::new(Arc::clone(&workflow)).with_input(input)
        })
        .collect();
    parallel_subworkflows(executor, ctx, children).await
}

/// Resolve with the first successful child, cancelling the rest
///
/// Fails only when every child fails.
pub async fn race(
    executor: &Executor,
    ctx: &NodeContext,
    children: Vec<ChildSpec>,
) -> Result<RunResult, NodeError> {
    if children.is_empty() {
        return Err(NodeError::non_retryable("race requires at least one child"));
    }

    let tokens: Vec<CancelToken> = children.iter().map(|_| CancelToken::new()).collect();
    let mut in_flight = FuturesUnordered::new();
    for (index, child) in children.into_iter().enumerate() {
        let options = child_options(ctx, child.input, tokens[index].clone());
        let future = executor.execute(child.workflow, options);
        in_flight.push(async move { (index, future.await) });
    }

    let mut last_error: Option<NodeError> = None;
    while let Some((index, result)) = in_flight.next().await {
        match result {
            Ok(run_result) if run_result.is_success() => {
                for (i, token) in tokens.iter().enumerate() {
                    if i != index {
                        token.cancel();
                    }
                }
                // Drain the cancelled children so their state settles.
                while in_flight.next().await.is_some() {}
                return Ok(run_result);
            }
            Ok(run_result) => {
                last_error = run_result.error().cloned().or(last_error);
            }
            Err(e) => {
                last_error = Some(NodeError::non_retryable(e.to_string()));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| NodeError::non_retryable("all race children failed"))
        .with_type("race_exhausted"))
}

/// Try children in order until one succeeds
pub async fn fallback(
    executor: &Executor,
    ctx: &NodeContext,
    children: Vec<ChildSpec>,
) -> Result<RunResult, NodeError> {
    let mut last_error: Option<NodeError> = None;

    for child in children {
        let name = child.workflow.name.clone();
        let options = child_options(ctx, child.input, ctx.cancel.clone());
        match executor.execute(child.workflow, options).await {
            Ok(result) if result.is_success() => return Ok(result),
            Ok(result) => {
                debug!(child = %name, "fallback child failed, trying next");
                last_error = result.error().cloned().or(last_error);
            }
            Err(e) => {
                last_error = Some(NodeError::non_retryable(e.to_string()));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| NodeError::non_retryable("fallback had no children"))
        .with_type("fallback_exhausted"))
}
