//! Execution events and callbacks
//!
//! The streaming variant of the executor emits ordered events over a
//! channel; a callbacks struct mirrors the same points for embedders
//! that prefer hooks over streams.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::NodeError;
use crate::model::RunState;

/// An ordered event emitted while a run executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A node dispatch started
    NodeStart {
        /// Run id
        run_id: Uuid,
        /// Node name
        node: String,
    },

    /// A node completed successfully
    NodeComplete {
        /// Run id
        run_id: Uuid,
        /// Node name
        node: String,
        /// Recorded output value
        output: serde_json::Value,
        /// Wall-clock duration
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// A node failed terminally
    NodeError {
        /// Run id
        run_id: Uuid,
        /// Node name
        node: String,
        /// The terminal error
        error: NodeError,
    },

    /// The run suspended (timer or approval)
    WorkflowWaiting {
        /// Run id
        run_id: Uuid,
        /// Node that owns the wait
        node: String,
    },

    /// The run reached a terminal status
    WorkflowComplete {
        /// Run id
        run_id: Uuid,
        /// Final state
        state: RunState,
        /// Total wall-clock duration
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
}

/// Callback hooks mirroring [`ExecutionEvent`]
#[derive(Default)]
pub struct ExecutionCallbacks {
    /// Invoked when a node dispatch starts
    pub on_node_start: Option<Box<dyn Fn(&str) + Send + Sync>>,

    /// Invoked when a node completes
    pub on_node_complete: Option<Box<dyn Fn(&str, &serde_json::Value, Duration) + Send + Sync>>,

    /// Invoked when a node fails terminally
    pub on_node_error: Option<Box<dyn Fn(&str, &NodeError) + Send + Sync>>,

    /// Invoked when the run reaches a terminal status
    pub on_workflow_complete: Option<Box<dyn Fn(&RunState, Duration) + Send + Sync>>,
}

impl ExecutionCallbacks {
    /// Create empty callbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook node starts
    pub fn node_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_node_start = Some(Box::new(f));
        self
    }

    /// Hook node completions
    pub fn node_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &serde_json::Value, Duration) + Send + Sync + 'static,
    {
        self.on_node_complete = Some(Box::new(f));
        self
    }

    /// Hook node failures
    pub fn node_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &NodeError) + Send + Sync + 'static,
    {
        self.on_node_error = Some(Box::new(f));
        self
    }

    /// Hook workflow completion
    pub fn workflow_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunState, Duration) + Send + Sync + 'static,
    {
        self.on_workflow_complete = Some(Box::new(f));
        self
    }
}

/// Delivers events to a channel and/or callbacks
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    channel: Option<mpsc::Sender<ExecutionEvent>>,
    callbacks: Option<Arc<ExecutionCallbacks>>,
}

impl EventSink {
    pub(crate) fn new(
        channel: Option<mpsc::Sender<ExecutionEvent>>,
        callbacks: Option<Arc<ExecutionCallbacks>>,
    ) -> Self {
        Self { channel, callbacks }
    }

    pub(crate) async fn emit(&self, event: ExecutionEvent) {
        if let Some(callbacks) = &self.callbacks {
            match &event {
                ExecutionEvent::NodeStart { node, .. } => {
                    if let Some(f) = &callbacks.on_node_start {
                        f(node);
                    }
                }
                ExecutionEvent::NodeComplete {
                    node,
                    output,
                    duration,
                    ..
                } => {
                    if let Some(f) = &callbacks.on_node_complete {
                        f(node, output, *duration);
                    }
                }
                ExecutionEvent::NodeError { node, error, .. } => {
                    if let Some(f) = &callbacks.on_node_error {
                        f(node, error);
                    }
                }
                ExecutionEvent::WorkflowComplete {
                    state, duration, ..
                } => {
                    if let Some(f) = &callbacks.on_workflow_complete {
                        f(state, *duration);
                    }
                }
                ExecutionEvent::WorkflowWaiting { .. } => {}
            }
        }
        if let Some(channel) = &self.channel {
            let _ = channel.send(event).await;
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = ExecutionEvent::NodeComplete {
            run_id: Uuid::now_v7(),
            node: "fetch".to_string(),
            output: json!({"ok": true}),
            duration: Duration::from_millis(12),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"node_complete\""));
        let parsed: ExecutionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[tokio::test]
    async fn test_sink_delivers_to_channel_and_callbacks() {
        let (tx, mut rx) = mpsc::channel(8);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let callbacks = Arc::new(ExecutionCallbacks::new().node_start(move |node| {
            seen_clone.lock().push(node.to_string());
        }));
        let sink = EventSink::new(Some(tx), Some(callbacks));

        sink.emit(ExecutionEvent::NodeStart {
            run_id: Uuid::now_v7(),
            node: "a".to_string(),
        })
        .await;

        assert_eq!(*seen.lock(), vec!["a".to_string()]);
        assert!(matches!(
            rx.recv().await,
            Some(ExecutionEvent::NodeStart { .. })
        ));
    }
}
