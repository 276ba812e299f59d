//! Run store: the durable source of truth for run lifecycles
//!
//! Persists every run's record through queued, running, waiting and
//! terminal states, and answers filtered queries with pagination and
//! aggregate stats. On startup the run manager consults this store to
//! recover or fail orphaned runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Run, RunStatus};
use crate::reliability::Pagination;

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Restrict to one status
    pub status: Option<RunStatus>,

    /// Restrict to one workflow
    pub workflow_name: Option<String>,

    /// Only runs created at or after this instant
    pub created_after: Option<DateTime<Utc>>,

    /// Only runs created before this instant
    pub created_before: Option<DateTime<Utc>>,
}

impl RunFilter {
    /// Filter to a status
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Filter to a workflow
    pub fn workflow(name: impl Into<String>) -> Self {
        Self {
            workflow_name: Some(name.into()),
            ..Default::default()
        }
    }

    fn matches(&self, run: &Run) -> bool {
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(ref name) = self.workflow_name {
            if &run.workflow_name != name {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if run.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if run.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// Aggregated run statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Runs in range
    pub total: usize,

    /// Counts by status
    pub by_status: BTreeMap<String, usize>,

    /// Mean terminal duration in milliseconds
    pub avg_duration_ms: Option<f64>,

    /// Tokens across runs in range
    pub total_tokens: u64,

    /// Cost across runs in range, micro-units
    pub total_cost_micros: u64,
}

/// Store for run records
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Persist a new run
    async fn create(&self, run: Run) -> Result<(), EngineError>;

    /// Look up a run
    async fn get(&self, run_id: Uuid) -> Result<Option<Run>, EngineError>;

    /// Replace a run's record
    async fn update(&self, run: Run) -> Result<(), EngineError>;

    /// List runs matching a filter, newest first
    async fn list(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<Run>, EngineError>;

    /// Aggregate stats over an optional created-at range
    async fn stats(
        &self,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<RunStats, EngineError>;
}

/// In-memory implementation of [`RunStore`]
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl InMemoryRunStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: Run) -> Result<(), EngineError> {
        self.runs.write().insert(run.run_id, run);
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<Run>, EngineError> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    async fn update(&self, run: Run) -> Result<(), EngineError> {
        let mut runs = self.runs.write();
        if !runs.contains_key(&run.run_id) {
            return Err(EngineError::NotFound(format!("run {}", run.run_id)));
        }
        runs.insert(run.run_id, run);
        Ok(())
    }

    async fn list(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<Run>, EngineError> {
        let runs = self.runs.read();
        let mut matched: Vec<Run> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.run_id.cmp(&a.run_id)));
        Ok(matched
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn stats(
        &self,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<RunStats, EngineError> {
        let runs = self.runs.read();
        let in_range: Vec<&Run> = runs
            .values()
            .filter(|r| match range {
                Some((start, end)) => r.created_at >= start && r.created_at < end,
                None => true,
            })
            .collect();

        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut durations_ms: Vec<f64> = Vec::new();
        let mut total_tokens = 0u64;
        let mut total_cost_micros = 0u64;

        for run in &in_range {
            *by_status.entry(run.status.to_string()).or_insert(0) += 1;
            total_tokens += run.tokens_used;
            total_cost_micros += run.cost_micros;
            if run.status.is_terminal() {
                if let Some(duration) = run.duration() {
                    durations_ms.push(duration.as_secs_f64() * 1000.0);
                }
            }
        }

        let avg_duration_ms = if durations_ms.is_empty() {
            None
        } else {
            Some(durations_ms.iter().sum::<f64>() / durations_ms.len() as f64)
        };

        Ok(RunStats {
            total: in_range.len(),
            by_status,
            avg_duration_ms,
            total_tokens,
            total_cost_micros,
        })
    }
}
