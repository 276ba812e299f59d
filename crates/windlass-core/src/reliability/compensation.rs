//! Saga-style compensation
//!
//! Nodes register a compensating action when they complete. On run
//! failure the manager invokes the registered actions in reverse
//! registration order; actions sharing a saga scope marked parallel run
//! concurrently, everything else is serialized. A compensation that fails
//! terminally is logged and skipped, and the run keeps its original
//! error.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use crate::clock::Clock;
use crate::error::NodeError;
use crate::model::{CompensationFn, NodeContext};

/// One registered compensation
struct CompensationEntry {
    node: String,
    scope: Option<String>,
    action: CompensationFn,
    ctx: NodeContext,
    retry: RetryPolicy,
}

/// Result of invoking one compensation
#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    /// Node the compensation belongs to
    pub node: String,

    /// Terminal error, if the compensation failed after its retries
    pub error: Option<NodeError>,

    /// Attempts consumed
    pub attempts: u32,
}

impl CompensationOutcome {
    /// Whether the compensation succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Collects compensations during a run and rolls them back on failure
pub struct CompensationManager {
    entries: Mutex<Vec<CompensationEntry>>,
    parallel_scopes: Mutex<HashSet<String>>,
    clock: Arc<dyn Clock>,
}

impl CompensationManager {
    /// Create an empty manager
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            parallel_scopes: Mutex::new(HashSet::new()),
            clock,
        }
    }

    /// Register a compensation for a completed node
    pub fn register(
        &self,
        node: impl Into<String>,
        ctx: NodeContext,
        action: CompensationFn,
        retry: Option<RetryPolicy>,
        scope: Option<String>,
    ) {
        let node = node.into();
        debug!(node = %node, "compensation registered");
        self.entries.lock().push(CompensationEntry {
            node,
            scope,
            action,
            ctx,
            retry: retry.unwrap_or_else(RetryPolicy::no_retry),
        });
    }

    /// Allow a saga scope's compensations to run concurrently
    pub fn set_parallel_scope(&self, scope: impl Into<String>) {
        self.parallel_scopes.lock().insert(scope.into());
    }

    /// Number of registered compensations
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no compensations are registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invoke all registered compensations in reverse registration order
    ///
    /// Consecutive entries sharing a parallel-marked scope are invoked
    /// concurrently; the rest run one at a time. Entries are consumed.
    pub async fn compensate_all(&self) -> Vec<CompensationOutcome> {
        let mut entries: Vec<CompensationEntry> = {
            let mut guard = self.entries.lock();
            guard.drain(..).collect()
        };
        entries.reverse();
        let parallel_scopes = self.parallel_scopes.lock().clone();

        let mut outcomes = Vec::with_capacity(entries.len());
        let mut i = 0;
        while i < entries.len() {
            let scope = entries[i].scope.clone();
            let parallel = scope
                .as_deref()
                .is_some_and(|s| parallel_scopes.contains(s));

            if parallel {
                // Batch the maximal run of entries in the same scope.
                let mut batch = vec![entries.remove(i)];
                while i < entries.len() && entries[i].scope == scope {
                    batch.push(entries.remove(i));
                }
                let results = join_all(
                    batch
                        .into_iter()
                        .map(|entry| self.run_one(entry)),
                )
                .await;
                outcomes.extend(results);
            } else {
                let entry = entries.remove(i);
                outcomes.push(self.run_one(entry).await);
            }
        }
        outcomes
    }

    async fn run_one(&self, entry: CompensationEntry) -> CompensationOutcome {
        let mut attempt = 1u32;
        loop {
            let ctx = entry.ctx.clone().with_attempt(attempt);
            match (entry.action)(ctx).await {
                Ok(()) => {
                    debug!(node = %entry.node, attempt, "compensation succeeded");
                    return CompensationOutcome {
                        node: entry.node,
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    let retry_allowed = error.retryable
                        && entry.retry.should_retry(error.error_type.as_deref())
                        && entry.retry.has_attempts_remaining(attempt);

                    if !retry_allowed {
                        warn!(
                            node = %entry.node,
                            attempt,
                            "compensation failed terminally, skipping: {error}"
                        );
                        return CompensationOutcome {
                            node: entry.node,
                            error: Some(error),
                            attempts: attempt,
                        };
                    }

                    attempt += 1;
                    let delay = entry.retry.delay_for_attempt(attempt);
                    if !delay.is_zero() {
                        self.clock.sleep(delay).await;
                    }
                }
            }
        }
    }
}
