//! Dead-letter queue
//!
//! Terminal node failures land here with their input, the errors
//! collected across attempts, and arbitrary tags. Entries can be
//! queried, counted, drained, or pulled back for re-enqueueing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, NodeError};

/// An entry in the dead-letter queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Entry id, sortable by enqueue time
    pub id: Uuid,

    /// Run the failure occurred in
    pub run_id: Uuid,

    /// Workflow identity
    pub workflow_id: Uuid,

    /// Workflow name
    pub workflow_name: String,

    /// Failing node
    pub node: String,

    /// Input the node failed on (its state snapshot)
    pub input: serde_json::Value,

    /// Attempts consumed before giving up
    pub attempts: u32,

    /// Terminal error
    pub error: NodeError,

    /// Errors collected across attempts, oldest first
    pub error_history: Vec<String>,

    /// Arbitrary tags
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// When the entry was enqueued
    pub enqueued_at: DateTime<Utc>,
}

/// Filter for listing DLQ entries
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    /// Restrict to one workflow
    pub workflow_name: Option<String>,

    /// Restrict to one node
    pub node: Option<String>,

    /// Restrict to one run
    pub run_id: Option<Uuid>,

    /// Require a tag key/value pair
    pub tag: Option<(String, String)>,

    /// Only entries enqueued at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl DlqFilter {
    fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(ref name) = self.workflow_name {
            if &entry.workflow_name != name {
                return false;
            }
        }
        if let Some(ref node) = self.node {
            if &entry.node != node {
                return false;
            }
        }
        if let Some(run_id) = self.run_id {
            if entry.run_id != run_id {
                return false;
            }
        }
        if let Some((ref key, ref value)) = self.tag {
            if entry.tags.get(key) != Some(value) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.enqueued_at < since {
                return false;
            }
        }
        true
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    /// Entries to skip
    pub offset: u32,

    /// Maximum entries to return
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Poison-message sink with a query API
///
/// Append-only aside from `drain` and `requeue`.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync + 'static {
    /// Append an entry
    async fn enqueue(&self, entry: DlqEntry) -> Result<Uuid, EngineError>;

    /// List entries matching a filter, newest first
    async fn list(
        &self,
        filter: DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DlqEntry>, EngineError>;

    /// Count entries matching a filter
    async fn count(&self, filter: DlqFilter) -> Result<usize, EngineError>;

    /// Remove and return all entries matching a filter
    async fn drain(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>, EngineError>;

    /// Remove one entry and hand it back for re-enqueueing
    async fn requeue(&self, id: Uuid) -> Result<DlqEntry, EngineError>;

    /// Remove entries older than the given instant, returning the count
    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError>;
}

/// In-memory implementation of [`DeadLetterQueue`]
#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    entries: RwLock<Vec<DlqEntry>>,
}

impl InMemoryDeadLetterQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn enqueue(&self, entry: DlqEntry) -> Result<Uuid, EngineError> {
        let id = entry.id;
        self.entries.write().push(entry);
        Ok(id)
    }

    async fn list(
        &self,
        filter: DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DlqEntry>, EngineError> {
        let entries = self.entries.read();
        let mut matched: Vec<DlqEntry> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));

        Ok(matched
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn count(&self, filter: DlqFilter) -> Result<usize, EngineError> {
        Ok(self.entries.read().iter().filter(|e| filter.matches(e)).count())
    }

    async fn drain(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>, EngineError> {
        let mut entries = self.entries.write();
        let (drained, kept): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| filter.matches(e));
        *entries = kept;
        Ok(drained)
    }

    async fn requeue(&self, id: Uuid) -> Result<DlqEntry, EngineError> {
        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("dlq entry {id}")))?;
        Ok(entries.remove(position))
    }

    async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.enqueued_at >= cutoff);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(workflow: &str, node: &str) -> DlqEntry {
        DlqEntry {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: workflow.to_string(),
            node: node.to_string(),
            input: json!({"x": 1}),
            attempts: 3,
            error: NodeError::retryable("gave up"),
            error_history: vec!["e1".to_string(), "e2".to_string(), "gave up".to_string()],
            tags: HashMap::new(),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_count() {
        let dlq = InMemoryDeadLetterQueue::new();
        dlq.enqueue(entry("w1", "a")).await.unwrap();
        dlq.enqueue(entry("w1", "b")).await.unwrap();
        dlq.enqueue(entry("w2", "a")).await.unwrap();

        assert_eq!(dlq.count(DlqFilter::default()).await.unwrap(), 3);
        assert_eq!(
            dlq.count(DlqFilter {
                workflow_name: Some("w1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap(),
            2
        );
        assert_eq!(
            dlq.count(DlqFilter {
                node: Some("a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_list_newest_first_with_pagination() {
        let dlq = InMemoryDeadLetterQueue::new();
        for i in 0..5 {
            let mut e = entry("w", "n");
            e.enqueued_at = Utc::now() + chrono::TimeDelta::seconds(i);
            dlq.enqueue(e).await.unwrap();
        }

        let page = dlq
            .list(
                DlqFilter::default(),
                Pagination {
                    offset: 1,
                    limit: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.len(), 2);
        assert!(page[0].enqueued_at > page[1].enqueued_at);
    }

    #[tokio::test]
    async fn test_tag_filter() {
        let dlq = InMemoryDeadLetterQueue::new();
        let mut tagged = entry("w", "n");
        tagged
            .tags
            .insert("tenant".to_string(), "acme".to_string());
        dlq.enqueue(tagged).await.unwrap();
        dlq.enqueue(entry("w", "n")).await.unwrap();

        let filter = DlqFilter {
            tag: Some(("tenant".to_string(), "acme".to_string())),
            ..Default::default()
        };
        assert_eq!(dlq.count(filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_removes_matching() {
        let dlq = InMemoryDeadLetterQueue::new();
        dlq.enqueue(entry("w1", "a")).await.unwrap();
        dlq.enqueue(entry("w2", "b")).await.unwrap();

        let drained = dlq
            .drain(DlqFilter {
                workflow_name: Some("w1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(drained.len(), 1);
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq.count(DlqFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requeue_removes_entry() {
        let dlq = InMemoryDeadLetterQueue::new();
        let id = dlq.enqueue(entry("w", "n")).await.unwrap();

        let pulled = dlq.requeue(id).await.unwrap();
        assert_eq!(pulled.id, id);
        assert!(dlq.is_empty());

        let missing = dlq.requeue(id).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_older_than() {
        let dlq = InMemoryDeadLetterQueue::new();
        let mut old = entry("w", "n");
        old.enqueued_at = Utc::now() - chrono::TimeDelta::days(8);
        dlq.enqueue(old).await.unwrap();
        dlq.enqueue(entry("w", "n")).await.unwrap();

        let removed = dlq
            .remove_older_than(Utc::now() - chrono::TimeDelta::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dlq.len(), 1);
    }
}
