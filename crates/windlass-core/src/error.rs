//! Error taxonomy for the engine
//!
//! Two layers: [`NodeError`] is the serializable record describing one
//! node failure (it travels through checkpoints, the dead-letter queue
//! and the idempotency store), while [`EngineError`] is the engine-level
//! error a caller sees.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error record for a failed node execution
///
/// This is a data record rather than a Rust error enum because it is
/// persisted: checkpoints, dead-letter entries and idempotency records
/// all carry it across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling (e.g. `timeout`,
    /// `upstream_open`, `approval_timeout`)
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors escape the retry loop immediately.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl NodeError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// A per-attempt deadline expiry (retryable by default)
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::retryable(message).with_type("timeout")
    }

    /// A circuit-breaker rejection (not retried locally)
    pub fn upstream_open(node: &str) -> Self {
        Self::non_retryable(format!("circuit breaker open for node {node}"))
            .with_type("upstream_open")
    }

    /// A run-level cancellation (terminal)
    pub fn cancelled() -> Self {
        Self::non_retryable("run cancelled").with_type("cancelled")
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the error carries the given type tag
    pub fn is_type(&self, error_type: &str) -> bool {
        self.error_type.as_deref() == Some(error_type)
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NodeError {}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Errors surfaced by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workflow failed validation at load time
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// A node exhausted its reliability envelope
    #[error("node {node} failed: {error}")]
    NodeFailed {
        /// Name of the failing node
        node: String,
        /// The terminal node error
        error: NodeError,
    },

    /// The executor exceeded its iteration cap
    #[error("iteration limit reached ({0} iterations)")]
    IterationLimit(u32),

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// An approval deadline expired with `timeout_action = fail`
    #[error("approval timed out for node {0}")]
    ApprovalTimeout(String),

    /// Subworkflow nesting exceeded the depth limit
    #[error("subworkflow depth limit exceeded (max {0})")]
    MaxDepthExceeded(u32),

    /// A run was found in `running` state with no owning executor
    #[error("run {0} orphaned on startup")]
    Orphaned(uuid::Uuid),

    /// Store operation failed
    #[error("store error: {0}")]
    Store(String),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A first-writer-wins operation lost the race
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// The node error for a `NodeFailed`, if that is what this is
    pub fn node_error(&self) -> Option<&NodeError> {
        match self {
            Self::NodeFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_retryable() {
        let error = NodeError::retryable("connection reset");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "connection reset");
    }

    #[test]
    fn test_node_error_timeout_is_retryable() {
        let error = NodeError::timeout("attempt exceeded 5s deadline");
        assert!(error.retryable);
        assert!(error.is_type("timeout"));
    }

    #[test]
    fn test_upstream_open_not_retryable() {
        let error = NodeError::upstream_open("fetch");
        assert!(!error.retryable);
        assert!(error.is_type("upstream_open"));
        assert!(error.message.contains("fetch"));
    }

    #[test]
    fn test_node_error_serialization() {
        let error = NodeError::retryable("test error")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: NodeError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }

    #[test]
    fn test_engine_error_display() {
        let error = EngineError::NodeFailed {
            node: "fetch".to_string(),
            error: NodeError::non_retryable("boom"),
        };
        assert_eq!(error.to_string(), "node fetch failed: boom");
        assert!(error.node_error().is_some());
    }
}
