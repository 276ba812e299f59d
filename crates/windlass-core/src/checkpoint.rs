//! Checkpoints: durable snapshots of run progress
//!
//! The executor writes a checkpoint after each committed node boundary.
//! Replaying the remaining graph from a checkpoint produces the same
//! terminal state as an uninterrupted run, provided nodes are idempotent
//! or registered with the idempotency store.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{NodeOutcome, Run, RunState, RunStatus, WaitReason, Workflow};

/// A snapshot of a run at a committed boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id, sortable by creation time
    pub id: Uuid,

    /// Run this checkpoint belongs to
    pub run_id: Uuid,

    /// Workflow name (for queries without loading the run)
    pub workflow_name: String,

    /// State at the boundary
    pub state: RunState,

    /// Nodes completed at the boundary
    pub completed_nodes: BTreeSet<String>,

    /// Per-node outcomes in completion order
    pub node_results: Vec<(String, NodeOutcome)>,

    /// Loop iteration counters
    #[serde(default)]
    pub loop_iterations: HashMap<String, u32>,

    /// Suspension reason, when the run checkpointed while waiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<WaitReason>,

    /// The ready set at the boundary; resumption continues from here
    #[serde(default)]
    pub frontier: Vec<String>,

    /// When the checkpoint was taken
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Capture a run's current progress
    pub fn capture(run: &Run) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id: run.run_id,
            workflow_name: run.workflow_name.clone(),
            state: run.state.clone(),
            completed_nodes: run.completed_nodes.clone(),
            node_results: run.node_results.clone(),
            loop_iterations: run.loop_iterations.clone(),
            waiting_on: run.waiting_on.clone(),
            frontier: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Record the ready set to continue from on resumption
    pub fn with_frontier<I, S>(mut self, frontier: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.frontier = frontier.into_iter().map(Into::into).collect();
        self
    }

    /// Rebuild a run from this checkpoint
    ///
    /// The restored run keeps its original id and is `running` again;
    /// counters not captured in the checkpoint restart at zero.
    pub fn restore(&self, workflow: &Workflow) -> Run {
        let mut run = Run::new(workflow);
        run.run_id = self.run_id;
        run.state = self.state.clone();
        run.completed_nodes = self.completed_nodes.clone();
        run.node_results = self.node_results.clone();
        run.loop_iterations = self.loop_iterations.clone();
        run.waiting_on = self.waiting_on.clone();
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        run
    }
}

/// Store for checkpoints
///
/// `save` is an atomic write-or-replace per checkpoint id; reads return a
/// consistent snapshot.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Persist a checkpoint (replacing any previous write of the same id)
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), EngineError>;

    /// Load a checkpoint by id
    async fn load(&self, id: Uuid) -> Result<Option<Checkpoint>, EngineError>;

    /// All checkpoints for a run, oldest first
    async fn list_by_run(&self, run_id: Uuid) -> Result<Vec<Checkpoint>, EngineError>;

    /// Most recent checkpoint for a run
    async fn latest_for_run(&self, run_id: Uuid) -> Result<Option<Checkpoint>, EngineError> {
        Ok(self.list_by_run(run_id).await?.into_iter().last())
    }

    /// Delete a checkpoint
    async fn delete(&self, id: Uuid) -> Result<(), EngineError>;
}

/// In-memory implementation of [`CheckpointStore`]
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<Uuid, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints
    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        self.checkpoints
            .write()
            .insert(checkpoint.id, checkpoint);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Checkpoint>, EngineError> {
        Ok(self.checkpoints.read().get(&id).cloned())
    }

    async fn list_by_run(&self, run_id: Uuid) -> Result<Vec<Checkpoint>, EngineError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .read()
            .values()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(checkpoints)
    }

    async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        self.checkpoints.write().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeDef, NodeOutput};
    use serde_json::json;
    use std::time::Duration;

    fn test_workflow() -> std::sync::Arc<Workflow> {
        Workflow::builder("w")
            .initial_state(json!({"x": 0}))
            .add_node(NodeDef::function("a", |_| async { Ok(NodeOutput::empty()) }))
            .add_node(NodeDef::function("b", |_| async { Ok(NodeOutput::empty()) }))
            .add_node(NodeDef::function("c", |_| async { Ok(NodeOutput::empty()) }))
            .entry_point("a")
            .build()
            .unwrap()
    }

    fn run_with_progress(workflow: &Workflow) -> Run {
        let mut run = Run::new(workflow);
        run.state.set("x", json!(5));
        run.record_outcome(
            "a",
            NodeOutcome {
                output: json!(1),
                duration: Duration::from_millis(2),
                attempts: 1,
                completed_at: Utc::now(),
            },
        );
        run
    }

    #[test]
    fn test_capture_and_restore() {
        let workflow = test_workflow();
        let run = run_with_progress(&workflow);

        let checkpoint = Checkpoint::capture(&run);
        assert_eq!(checkpoint.run_id, run.run_id);
        assert!(checkpoint.completed_nodes.contains("a"));

        let restored = checkpoint.restore(&workflow);
        assert_eq!(restored.run_id, run.run_id);
        assert_eq!(restored.state.get_i64("x"), Some(5));
        assert_eq!(restored.status, RunStatus::Running);
        assert_eq!(restored.output("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryCheckpointStore::new();
        let workflow = test_workflow();
        let checkpoint = Checkpoint::capture(&run_with_progress(&workflow));

        store.save(checkpoint.clone()).await.unwrap();
        let loaded = store.load(checkpoint.id).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_save_replaces_same_id() {
        let store = InMemoryCheckpointStore::new();
        let workflow = test_workflow();
        let mut checkpoint = Checkpoint::capture(&run_with_progress(&workflow));

        store.save(checkpoint.clone()).await.unwrap();
        checkpoint.state.set("x", json!(99));
        store.save(checkpoint.clone()).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load(checkpoint.id).await.unwrap().unwrap();
        assert_eq!(loaded.state.get_i64("x"), Some(99));
    }

    #[tokio::test]
    async fn test_list_by_run_ordered_and_latest() {
        let store = InMemoryCheckpointStore::new();
        let workflow = test_workflow();
        let mut run = run_with_progress(&workflow);

        let first = Checkpoint::capture(&run);
        store.save(first.clone()).await.unwrap();

        run.record_outcome(
            "b",
            NodeOutcome {
                output: json!(2),
                duration: Duration::from_millis(1),
                attempts: 1,
                completed_at: Utc::now(),
            },
        );
        let second = Checkpoint::capture(&run);
        store.save(second.clone()).await.unwrap();

        // A checkpoint from an unrelated run must not appear
        let other = Checkpoint::capture(&Run::new(&workflow));
        store.save(other).await.unwrap();

        let listed = store.list_by_run(run.run_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);

        let latest = store.latest_for_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(latest.completed_nodes.contains("b"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryCheckpointStore::new();
        let workflow = test_workflow();
        let checkpoint = Checkpoint::capture(&run_with_progress(&workflow));

        store.save(checkpoint.clone()).await.unwrap();
        store.delete(checkpoint.id).await.unwrap();
        assert!(store.load(checkpoint.id).await.unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_serialization() {
        let workflow = test_workflow();
        let checkpoint = Checkpoint::capture(&run_with_progress(&workflow));

        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(checkpoint, parsed);
    }
}
