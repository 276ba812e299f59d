//! Run records
//!
//! A run is the mutable instance of a workflow: its state snapshot,
//! completed nodes, per-node outcomes, status and counters. Run ids are
//! UUID v7 so they sort lexicographically by creation time.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::RunState;
use super::workflow::Workflow;
use crate::error::NodeError;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Enqueued, waiting for an executor slot
    Queued,

    /// Owned by an executor and making progress
    Running,

    /// Suspended on a timer, approval, or rate-limit token
    Waiting,

    /// Completed successfully
    Completed,

    /// Failed terminally
    Failed,

    /// Cancelled
    Cancelled,

    /// Exceeded a run-level deadline
    TimedOut,
}

impl RunStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Why a run is suspended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitReason {
    /// Waiting for a timer to fire
    Timer {
        /// Pending timer id
        timer_id: Uuid,
        /// Node that owns the wait
        node: String,
    },

    /// Waiting for an approval response
    Approval {
        /// Pending request id
        request_id: Uuid,
        /// Node that owns the wait
        node: String,
    },
}

/// Outcome of one completed node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    /// Recorded output value
    pub output: serde_json::Value,

    /// Wall-clock execution duration
    #[serde(with = "duration_millis")]
    pub duration: Duration,

    /// Attempts consumed (1 = no retries)
    pub attempts: u32,

    /// When the node completed
    pub completed_at: DateTime<Utc>,
}

/// The mutable instance of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run id, sortable by creation time
    pub run_id: Uuid,

    /// Identity of the workflow definition
    pub workflow_id: Uuid,

    /// Workflow name
    pub workflow_name: String,

    /// Current state snapshot
    pub state: RunState,

    /// Names of completed nodes
    pub completed_nodes: BTreeSet<String>,

    /// Per-node outcomes in completion order
    pub node_results: Vec<(String, NodeOutcome)>,

    /// Lifecycle status
    pub status: RunStatus,

    /// Scheduling priority (higher first)
    pub priority: i32,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// When the run started executing
    pub started_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,

    /// Per-loop-head iteration counters
    #[serde(default)]
    pub loop_iterations: HashMap<String, u32>,

    /// Why the run is suspended, when status is `waiting`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<WaitReason>,

    /// Tokens consumed by agent nodes
    #[serde(default)]
    pub tokens_used: u64,

    /// Accumulated cost in micro-units
    #[serde(default)]
    pub cost_micros: u64,

    /// Terminal error, when status is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

impl Run {
    /// Create a queued run for a workflow
    pub fn new(workflow: &Workflow) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            state: RunState::from_patch(workflow.initial_state.clone()),
            completed_nodes: BTreeSet::new(),
            node_results: Vec::new(),
            status: RunStatus::Queued,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            loop_iterations: HashMap::new(),
            waiting_on: None,
            tokens_used: 0,
            cost_micros: 0,
            error: None,
        }
    }

    /// Record a node outcome and mark the node completed
    pub fn record_outcome(&mut self, node: impl Into<String>, outcome: NodeOutcome) {
        let node = node.into();
        self.completed_nodes.insert(node.clone());
        self.node_results.push((node, outcome));
    }

    /// Outcome of a node, if it completed
    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.node_results
            .iter()
            .rev()
            .find(|(name, _)| name == node)
            .map(|(_, outcome)| outcome)
    }

    /// Output value of a node, if it completed
    pub fn output(&self, node: &str) -> Option<&serde_json::Value> {
        self.outcome(node).map(|o| &o.output)
    }

    /// Wall-clock duration so far (or total, once finished)
    pub fn duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - start).to_std().ok()
    }
}

/// Final result of driving a run
#[derive(Debug, Clone)]
pub struct RunResult {
    /// The run in its terminal (or suspended) condition
    pub run: Run,
}

impl RunResult {
    /// Whether the run completed successfully
    pub fn is_success(&self) -> bool {
        self.run.status == RunStatus::Completed
    }

    /// Final state
    pub fn state(&self) -> &RunState {
        &self.run.state
    }

    /// Output value of a node, if it completed
    pub fn output(&self, node: &str) -> Option<&serde_json::Value> {
        self.run.output(node)
    }

    /// Terminal error, if the run failed
    pub fn error(&self) -> Option<&NodeError> {
        self.run.error.as_ref()
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
