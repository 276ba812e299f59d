//! The reliability envelope around every node dispatch
//!
//! Outer to inner: cancellation check, circuit breaker gate, idempotency
//! check, retry loop, per-attempt timeout, node execution, recording
//! (breaker bookkeeping, idempotency write, compensation registration,
//! dead-letter enqueue on terminal failure).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use windlass_observability::{metrics::names, SpanKind};

use super::Executor;
use crate::error::NodeError;
use crate::model::{NodeContext, NodeDef, NodeKind, NodeOutput, Workflow};
use crate::patterns;
use crate::reliability::{
    idempotency_key, CompensationManager, DlqEntry, IdempotencyOutcome, RetryPolicy,
};

/// What one dispatch through the envelope produced
#[derive(Debug)]
pub(crate) struct DispatchResult {
    pub node: String,
    pub outcome: Result<NodeOutput, NodeError>,
    pub attempts: u32,
    pub duration: Duration,
    pub error_history: Vec<String>,
    pub tokens: u64,
    pub cost_micros: u64,
}

impl Executor {
    /// Drive one node through the reliability envelope
    pub(crate) async fn dispatch_node(
        &self,
        workflow: Arc<Workflow>,
        node_name: String,
        ctx: NodeContext,
        compensations: Arc<CompensationManager>,
    ) -> DispatchResult {
        let started = Instant::now();
        let Some(node) = workflow.node(&node_name) else {
            return DispatchResult {
                node: node_name.clone(),
                outcome: Err(NodeError::non_retryable(format!(
                    "node {node_name} missing from workflow"
                ))),
                attempts: 0,
                duration: started.elapsed(),
                error_history: vec![],
                tokens: 0,
                cost_micros: 0,
            };
        };

        let mut span = self.tracer.as_ref().map(|tracer| {
            tracer
                .start_span("node.execute", SpanKind::Internal, ctx.trace.as_ref())
                .with_attribute("workflow.name", workflow.name.as_str())
                .with_attribute("run.id", ctx.run_id.to_string())
                .with_attribute("node.name", node_name.as_str())
                .with_attribute("node.kind", node.kind.tag())
        });

        let mut result = self
            .dispatch_layers(&workflow, node, ctx.clone(), &compensations)
            .await;
        result.duration = started.elapsed();

        // Span + metrics recording for every outcome.
        if let Some(metrics) = &self.metrics {
            metrics.record_duration(
                format!("{}.{}", names::NODE_DURATION, node_name),
                result.duration,
            );
            if result.attempts > 1 {
                metrics.add(names::RETRIES, (result.attempts - 1) as u64);
            }
            if result.tokens > 0 {
                metrics.add(names::TOKENS, result.tokens);
            }
            if result.cost_micros > 0 {
                metrics.add(names::COST_MICROS, result.cost_micros);
            }
        }
        if let Some(span) = span.as_mut() {
            span.set_attribute("retry.attempt", i64::from(result.attempts));
            if let Some(breaker) = self.breakers.get(&node_name) {
                span.set_attribute("breaker.state", breaker.state().to_string());
            }
            match &result.outcome {
                Ok(_) => {
                    span.set_attribute("node.status", "completed");
                    span.end_ok();
                }
                Err(error) => {
                    span.set_attribute("node.status", "failed");
                    span.end_error(error.message.clone());
                }
            }
        }
        if let (Some(tracer), Some(span)) = (&self.tracer, span) {
            tracer.finish(span).await;
        }

        result
    }

    async fn dispatch_layers(
        &self,
        workflow: &Arc<Workflow>,
        node: &NodeDef,
        ctx: NodeContext,
        compensations: &Arc<CompensationManager>,
    ) -> DispatchResult {
        let node_name = node.name.clone();
        let mut error_history = Vec::new();

        // Layer 1: cancellation.
        if ctx.cancel.is_cancelled() {
            return DispatchResult {
                node: node_name,
                outcome: Err(NodeError::cancelled()),
                attempts: 0,
                duration: Duration::ZERO,
                error_history,
                tokens: 0,
                cost_micros: 0,
            };
        }

        // Layer 2: circuit breaker gate.
        let breaker = node
            .circuit_breaker
            .as_ref()
            .map(|config| self.breakers.breaker(&node_name, config));
        if let Some(breaker) = &breaker {
            let before = breaker.state();
            if breaker.try_acquire().is_err() {
                debug!(node = %node_name, "circuit breaker rejected dispatch");
                return DispatchResult {
                    node: node_name.clone(),
                    outcome: Err(NodeError::upstream_open(&node_name)),
                    attempts: 0,
                    duration: Duration::ZERO,
                    error_history,
                    tokens: 0,
                    cost_micros: 0,
                };
            }
            let after = breaker.state();
            if before != after {
                if let Some(metrics) = &self.metrics {
                    metrics.increment(format!("{}.{}", names::BREAKER_TRANSITIONS, after));
                }
            }
        }

        // Layer 3: idempotency.
        let idem_key = if node.idempotent && self.idempotency.is_some() {
            Some(idempotency_key(
                workflow.id,
                &node_name,
                &ctx.state.to_value(),
            ))
        } else {
            None
        };
        if let (Some(key), Some(store)) = (&idem_key, &self.idempotency) {
            match store.check(key).await {
                Ok(Some(record)) => {
                    debug!(node = %node_name, "idempotency cache hit");
                    return match record.outcome {
                        IdempotencyOutcome::Completed { result } => {
                            let output: NodeOutput =
                                serde_json::from_value(result).unwrap_or_default();
                            if let Some(breaker) = &breaker {
                                breaker.record_success();
                            }
                            self.register_compensation(node, &ctx, compensations);
                            DispatchResult {
                                node: node_name,
                                outcome: Ok(output),
                                attempts: 0,
                                duration: Duration::ZERO,
                                error_history,
                                tokens: 0,
                                cost_micros: 0,
                            }
                        }
                        IdempotencyOutcome::Failed { error } => {
                            if let Some(breaker) = &breaker {
                                breaker.record_failure();
                            }
                            DispatchResult {
                                node: node_name,
                                outcome: Err(error),
                                attempts: 0,
                                duration: Duration::ZERO,
                                error_history,
                                tokens: 0,
                                cost_micros: 0,
                            }
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => warn!(node = %node_name, "idempotency check failed: {e}"),
            }
        }

        // Layers 4-6: retry loop, per-attempt timeout, execution.
        let policy = node
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let attempt_timeout = node.timeout.or(self.config.default_timeout);

        let mut attempt = 1u32;
        let mut tokens = 0u64;
        let mut cost_micros = 0u64;

        let terminal = loop {
            let attempt_ctx = ctx.clone().with_attempt(attempt);
            let call = self.execute_kind(workflow, node, attempt_ctx);
            let result = match attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::timeout(format!(
                        "node {node_name} exceeded {}ms deadline",
                        limit.as_millis()
                    ))),
                },
                None => call.await,
            };

            match result {
                Ok((output, call_tokens, call_cost)) => {
                    tokens += call_tokens;
                    cost_micros += call_cost;
                    break Ok(output);
                }
                Err(error) => {
                    error_history.push(error.message.clone());
                    let retry_allowed = error.retryable
                        && policy.should_retry(error.error_type.as_deref())
                        && policy.has_attempts_remaining(attempt)
                        && !ctx.cancel.is_cancelled();
                    if !retry_allowed {
                        break Err(error);
                    }
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        node = %node_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying node"
                    );
                    if !delay.is_zero() {
                        self.clock.sleep(delay).await;
                    }
                }
            }
        };

        // Layer 7: recording.
        match &terminal {
            Ok(output) => {
                if let Some(breaker) = &breaker {
                    breaker.record_success();
                }
                if let (Some(key), Some(store)) = (&idem_key, &self.idempotency) {
                    if let Ok(result) = serde_json::to_value(output) {
                        let _ = store
                            .store(key, IdempotencyOutcome::Completed { result })
                            .await;
                    }
                }
                self.register_compensation(node, &ctx, compensations);
            }
            Err(error) => {
                let cancelled = error.is_type("cancelled");
                if !cancelled {
                    if let Some(breaker) = &breaker {
                        breaker.record_failure();
                    }
                    if let (Some(key), Some(store)) = (&idem_key, &self.idempotency) {
                        let _ = store
                            .store(
                                key,
                                IdempotencyOutcome::Failed {
                                    error: error.clone(),
                                },
                            )
                            .await;
                    }
                    if let Some(dlq) = &self.dlq {
                        let entry = DlqEntry {
                            id: Uuid::now_v7(),
                            run_id: ctx.run_id,
                            workflow_id: workflow.id,
                            workflow_name: workflow.name.clone(),
                            node: node_name.clone(),
                            input: ctx.state.to_value(),
                            attempts: attempt,
                            error: error.clone(),
                            error_history: error_history.clone(),
                            tags: std::collections::HashMap::from([(
                                "node_kind".to_string(),
                                node.kind.tag().to_string(),
                            )]),
                            enqueued_at: Utc::now(),
                        };
                        if let Err(e) = dlq.enqueue(entry).await {
                            warn!(node = %node_name, "dead-letter enqueue failed: {e}");
                        }
                    }
                }
            }
        }

        DispatchResult {
            node: node_name,
            outcome: terminal,
            attempts: attempt,
            duration: Duration::ZERO, // filled by the caller
            error_history,
            tokens,
            cost_micros,
        }
    }

    fn register_compensation(
        &self,
        node: &NodeDef,
        ctx: &NodeContext,
        compensations: &Arc<CompensationManager>,
    ) {
        if let Some(action) = &node.compensation {
            compensations.register(
                node.name.clone(),
                ctx.clone(),
                Arc::clone(action),
                node.compensation_retry
                    .clone()
                    .or_else(|| Some(RetryPolicy::no_retry())),
                node.compensation_scope.clone(),
            );
        }
    }

    /// Dispatch on the node kind
    async fn execute_kind(
        &self,
        workflow: &Arc<Workflow>,
        node: &NodeDef,
        ctx: NodeContext,
    ) -> Result<(NodeOutput, u64, u64), NodeError> {
        match &node.kind {
            NodeKind::Function(f) => f(ctx).await.map(|output| (output, 0, 0)),

            NodeKind::Agent { driver, config } => {
                let reply = driver.complete(&ctx, config).await?;
                let output = NodeOutput::empty()
                    .set(config.output_key.clone(), reply.output.clone())
                    .with_value(reply.output);
                Ok((output, reply.tokens, reply.cost_micros))
            }

            NodeKind::Tool { tool, config } => {
                let args = match &config.args_key {
                    Some(key) => ctx.state.get(key).cloned().unwrap_or(serde_json::Value::Null),
                    None => ctx.state.to_value(),
                };
                let result = tool.invoke(args).await?;
                let output = NodeOutput::empty()
                    .set(config.output_key.clone(), result.clone())
                    .with_value(result);
                Ok((output, 0, 0))
            }

            NodeKind::Subworkflow(config) => patterns::run_subworkflow(self, &ctx, config)
                .await
                .map(|output| (output, 0, 0)),

            NodeKind::Map(config) => {
                let outcomes = patterns::run_map(config, &ctx).await?;
                let value = serde_json::to_value(&outcomes)
                    .map_err(|e| NodeError::non_retryable(e.to_string()))?;
                let output = NodeOutput::empty()
                    .set(config.output_key.clone(), value.clone())
                    .with_value(value);
                Ok((output, 0, 0))
            }

            NodeKind::Reduce(config) => {
                let outcomes: Vec<patterns::ItemOutcome> = ctx
                    .state
                    .get(&config.source_key)
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| {
                        NodeError::non_retryable(format!(
                            "field {} does not hold map outcomes: {e}",
                            config.source_key
                        ))
                    })?
                    .unwrap_or_default();
                let value = patterns::run_reduce(config, &ctx.state, &outcomes);
                let output = NodeOutput::empty()
                    .set(config.output_key.clone(), value.clone())
                    .with_value(value);
                Ok((output, 0, 0))
            }

            NodeKind::MapReduce(config) => {
                let (value, outcomes) = patterns::run_map_reduce(config, &ctx).await?;
                let outcomes_value = serde_json::to_value(&outcomes)
                    .map_err(|e| NodeError::non_retryable(e.to_string()))?;
                let output = NodeOutput::empty()
                    .set(config.map.output_key.clone(), outcomes_value)
                    .set(config.reduce.output_key.clone(), value.clone())
                    .with_value(value);
                Ok((output, 0, 0))
            }

            NodeKind::Custom(handler) => handler.execute(ctx).await.map(|output| (output, 0, 0)),

            // Suspension kinds never reach the envelope; the run loop
            // intercepts them before dispatch.
            NodeKind::Human(_) | NodeKind::Timer(_) => Err(NodeError::non_retryable(format!(
                "node {} suspends and cannot be dispatched directly",
                node.name
            ))),
        }
    }
}
