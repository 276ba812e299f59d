//! Priority queue for admitted runs
//!
//! Ordered by (priority descending, enqueue time ascending), so a
//! higher-priority run always dequeues first and equal priorities are
//! served in arrival order.

use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

/// A queued run reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRun {
    /// Run id
    pub run_id: Uuid,

    /// Scheduling priority (higher first)
    pub priority: i32,

    /// When the run was enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl Ord for QueuedRun {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then earlier enqueue time.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.run_id.cmp(&self.run_id))
    }
}

impl PartialOrd for QueuedRun {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Thread-safe priority queue of runs awaiting a slot
#[derive(Default)]
pub struct RunQueue {
    heap: Mutex<BinaryHeap<QueuedRun>>,
}

impl RunQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a run
    pub fn push(&self, run_id: Uuid, priority: i32) {
        self.heap.lock().push(QueuedRun {
            run_id,
            priority,
            enqueued_at: Utc::now(),
        });
    }

    /// Dequeue the highest-priority run
    pub fn pop(&self) -> Option<QueuedRun> {
        self.heap.lock().pop()
    }

    /// Number of queued runs
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
