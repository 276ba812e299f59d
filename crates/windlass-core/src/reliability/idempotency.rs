//! Idempotency store
//!
//! Deduplicates node executions: a key derived from (workflow id, node
//! id, canonicalized input) maps to the recorded result or error of the
//! first execution. Records expire after a TTL and are swept by the
//! maintenance scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EngineError, NodeError};

/// Outcome recorded under an idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IdempotencyOutcome {
    /// The execution completed; replay returns the cached result
    Completed {
        /// Cached result value
        result: serde_json::Value,
    },

    /// The execution failed terminally; replay re-raises the error
    Failed {
        /// Recorded error
        error: NodeError,
    },
}

/// A stored idempotency record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Key this record is stored under
    pub key: String,

    /// Recorded outcome
    pub outcome: IdempotencyOutcome,

    /// When the record was written
    pub created_at: DateTime<Utc>,

    /// When the record expires
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether the record has expired at the given instant
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Compute an idempotency key
///
/// Stable SHA-256 over the workflow id, node id and the canonicalized
/// input (object keys sorted recursively), hex-encoded.
pub fn idempotency_key(workflow_id: Uuid, node_id: &str, input: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update(node_id.as_bytes());
    hasher.update(canonical_json(input).as_bytes());
    hex::encode(hasher.finalize())
}

/// Render a JSON value with object keys sorted recursively
///
/// Two structurally equal inputs always produce the same string, whatever
/// the field order they were built with.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Store for idempotency records
///
/// Keyed writes are atomic; concurrent attempts with the same key resolve
/// to the same record (the first writer wins, the loser reads the stored
/// record back).
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Look up a live record
    async fn check(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError>;

    /// Store an outcome under a key
    ///
    /// Returns the record now stored under the key: the caller's when it
    /// won the write, the previous writer's otherwise.
    async fn store(
        &self,
        key: &str,
        outcome: IdempotencyOutcome,
    ) -> Result<IdempotencyRecord, EngineError>;

    /// Get a record regardless of expiry
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError>;

    /// Delete a record
    async fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// Remove expired records, returning how many were swept
    async fn sweep_expired(&self) -> Result<usize, EngineError>;
}

/// In-memory implementation of [`IdempotencyStore`]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    /// Create a store with the given record TTL
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Number of records (including expired, pre-sweep)
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError> {
        let now = self.clock.now();
        let records = self.records.read();
        Ok(records
            .get(key)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn store(
        &self,
        key: &str,
        outcome: IdempotencyOutcome,
    ) -> Result<IdempotencyRecord, EngineError> {
        let now = self.clock.now();
        let mut records = self.records.write();

        if let Some(existing) = records.get(key) {
            if !existing.is_expired(now) {
                return Ok(existing.clone());
            }
        }

        let record = IdempotencyRecord {
            key: key.to_string(),
            outcome,
            created_at: now,
            expires_at: now + chrono::TimeDelta::from_std(self.ttl).unwrap_or(chrono::TimeDelta::zero()),
        };
        records.insert(key.to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, EngineError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn store_with_clock(ttl: Duration) -> (Arc<ManualClock>, InMemoryIdempotencyStore) {
        let clock = Arc::new(ManualClock::new());
        let store = InMemoryIdempotencyStore::new(ttl, clock.clone());
        (clock, store)
    }

    #[test]
    fn test_key_is_stable_across_field_order() {
        let workflow_id = Uuid::now_v7();
        let a = idempotency_key(workflow_id, "n", &json!({"x": 1, "y": [2, {"b": 3, "a": 4}]}));
        let b = idempotency_key(workflow_id, "n", &json!({"y": [2, {"a": 4, "b": 3}], "x": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_differs_across_inputs() {
        let workflow_id = Uuid::now_v7();
        let a = idempotency_key(workflow_id, "n", &json!({"x": 1}));
        let b = idempotency_key(workflow_id, "n", &json!({"x": 2}));
        let c = idempotency_key(workflow_id, "m", &json!({"x": 1}));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_store_and_check() {
        let (_clock, store) = store_with_clock(Duration::from_secs(60));

        let record = store
            .store(
                "k1",
                IdempotencyOutcome::Completed {
                    result: json!({"ok": true}),
                },
            )
            .await
            .unwrap();

        let found = store.check("k1").await.unwrap().unwrap();
        assert_eq!(found, record);
        assert!(store.check("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let (_clock, store) = store_with_clock(Duration::from_secs(60));

        let first = store
            .store("k", IdempotencyOutcome::Completed { result: json!(1) })
            .await
            .unwrap();
        let second = store
            .store("k", IdempotencyOutcome::Completed { result: json!(2) })
            .await
            .unwrap();

        // The loser reads the first writer's record back
        assert_eq!(second, first);
        assert_eq!(
            second.outcome,
            IdempotencyOutcome::Completed { result: json!(1) }
        );
    }

    #[tokio::test]
    async fn test_expired_record_not_returned_by_check() {
        let (clock, store) = store_with_clock(Duration::from_secs(10));

        store
            .store("k", IdempotencyOutcome::Completed { result: json!(1) })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));

        assert!(store.check("k").await.unwrap().is_none());
        // get() still sees it until swept
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_record_can_be_overwritten() {
        let (clock, store) = store_with_clock(Duration::from_secs(10));

        store
            .store("k", IdempotencyOutcome::Completed { result: json!(1) })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));

        let record = store
            .store("k", IdempotencyOutcome::Completed { result: json!(2) })
            .await
            .unwrap();
        assert_eq!(
            record.outcome,
            IdempotencyOutcome::Completed { result: json!(2) }
        );
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (clock, store) = store_with_clock(Duration::from_secs(10));

        store
            .store("a", IdempotencyOutcome::Completed { result: json!(1) })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));
        store
            .store(
                "b",
                IdempotencyOutcome::Failed {
                    error: NodeError::non_retryable("boom"),
                },
            )
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));

        let swept = store.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_clock, store) = store_with_clock(Duration::from_secs(60));
        store
            .store("k", IdempotencyOutcome::Completed { result: json!(1) })
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }
}
