//! # Windlass
//!
//! A durable, observable workflow orchestration engine for graph-shaped
//! computations.
//!
//! ## Features
//!
//! - **Graph workflows**: typed nodes routed by sequential, conditional,
//!   parallel and loop edges
//! - **Durable runs**: checkpoint after every committed boundary, resume
//!   after process death at the last one
//! - **Reliability envelope**: circuit breaker, idempotency, retries with
//!   backoff, per-attempt timeouts, saga compensation and a dead-letter
//!   queue around every node dispatch
//! - **Timers and approvals**: runs suspend durably on fixed/dynamic/
//!   cron/until timers and long-lived human approval requests
//! - **Run manager**: priority-scheduled admission under a global
//!   concurrency cap, with restart recovery
//! - **Triggers**: cron schedules, signed webhooks and in-process events
//!   create runs; token-bucket and sliding-window admission
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TriggerManager                        │
//! │        (cron schedules, webhooks, event bindings)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ enqueue
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         RunManager                           │
//! │   (priority queue, concurrency cap, run store, recovery)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ dispatch
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Executor                            │
//! │  (scheduler waves, reliability envelope, state merge,        │
//! │   checkpoints, suspension on timers/approvals)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use windlass_core::prelude::*;
//! use serde_json::json;
//!
//! let workflow = Workflow::builder("pipeline")
//!     .initial_state(json!({"count": 0}))
//!     .add_node(NodeDef::function("fetch", |ctx| async move {
//!         Ok(NodeOutput::empty().set("data", json!([1, 2, 3])))
//!     }))
//!     .add_node(NodeDef::function("store", |ctx| async move {
//!         Ok(NodeOutput::empty().set("stored", json!(true)))
//!     }))
//!     .add_edge(Edge::sequential("fetch", "store"))
//!     .entry_point("fetch")
//!     .build()?;
//!
//! let executor = Arc::new(Executor::new(ExecutorConfig::default()));
//! let result = executor.execute(workflow, ExecuteOptions::new()).await?;
//! ```

pub mod approval;
pub mod cancel;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod patterns;
pub mod reliability;
pub mod runs;
pub mod scheduler;
pub mod timer;
pub mod trigger;

/// Prelude for common imports
pub mod prelude {
    pub use crate::approval::{
        ApprovalManager, ApprovalNodeConfig, ApprovalRequest, ApprovalResponse, ApprovalStore,
        Decision, InMemoryApprovalStore, Notifier, TimeoutAction,
    };
    pub use crate::cancel::CancelToken;
    pub use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::error::{EngineError, NodeError};
    pub use crate::executor::{
        ExecuteOptions, ExecutionCallbacks, ExecutionEvent, Executor, ExecutorConfig,
    };
    pub use crate::model::{
        Edge, NodeContext, NodeDef, NodeOutput, Run, RunResult, RunState, RunStatus, StatePatch,
        Workflow,
    };
    pub use crate::patterns::{MapConfig, MapReduceConfig, ReduceConfig, SubworkflowConfig};
    pub use crate::reliability::{
        CircuitBreakerConfig, DeadLetterQueue, IdempotencyStore, InMemoryDeadLetterQueue,
        InMemoryIdempotencyStore, RetryPolicy,
    };
    pub use crate::runs::{InMemoryRunStore, RunManager, RunManagerConfig, RunStore};
    pub use crate::timer::{
        CronSchedule, InMemoryTimerStore, TimerManager, TimerManagerConfig, TimerNodeConfig,
        TimerStore,
    };
    pub use crate::trigger::{TokenBucket, TokenBucketConfig, TriggerManager, WebhookRequest};
}

// Re-export key types at crate root
pub use cancel::CancelToken;
pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
pub use config::EngineConfig;
pub use error::{EngineError, NodeError, Result};
pub use executor::{ExecuteOptions, ExecutionCallbacks, ExecutionEvent, Executor, ExecutorConfig};
pub use model::{
    Edge, NodeContext, NodeDef, NodeKind, NodeOutput, Run, RunResult, RunState, RunStatus,
    StatePatch, Workflow,
};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use runs::{RunManager, RunManagerConfig, RunStore};
