//! Per-node circuit breakers
//!
//! A breaker isolates a repeatedly failing node: after `failure_threshold`
//! failures the circuit opens and dispatches fail fast; once
//! `reset_timeout` elapses a bounded number of half-open probes are
//! admitted, and `success_threshold` consecutive successes close the
//! circuit again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the node recovered - limited probes allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲   any failure             │
///      │                               └────────────────────────── │
///      │              success threshold                            │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use windlass_core::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_reset_timeout(Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    pub failure_threshold: u32,

    /// Consecutive successes required to close the circuit (in half-open)
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Maximum concurrent probes admitted while half-open
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout (time before probing after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the half-open probe cap
    pub fn with_half_open_max(mut self, max: u32) -> Self {
        self.half_open_max = max.max(1);
        self
    }
}

/// Why an acquisition was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// Circuit is open and the reset timeout has not elapsed
    Open,

    /// Circuit is half-open and all probe slots are taken
    ProbeLimit,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,

    /// Failure count in the closed state
    pub failures: u32,

    /// Consecutive successes in the half-open state
    pub successes: u32,

    /// When the state last changed
    pub last_state_change_at: DateTime<Utc>,

    /// Probes currently in flight (half-open only)
    pub half_open_attempts: u32,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    consecutive_successes: u32,
    opened_at: Option<DateTime<Utc>>,
    last_state_change_at: DateTime<Utc>,
    half_open_in_flight: u32,
}

/// A per-node circuit breaker
pub struct CircuitBreaker {
    node: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker for the given node
    pub fn new(node: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            node: node.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                last_state_change_at: now,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Ask the breaker to admit a call
    ///
    /// While open, the call is rejected until `reset_timeout` has elapsed
    /// since the circuit opened; the first admitted call after that moves
    /// the breaker to half-open. While half-open, at most `half_open_max`
    /// probes run concurrently.
    pub fn try_acquire(&self) -> Result<(), BreakerRejection> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.signed_duration_since(at))
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or(Duration::ZERO);

                if elapsed >= self.config.reset_timeout {
                    debug!(node = %self.node, "circuit breaker half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_in_flight = 1;
                    inner.last_state_change_at = now;
                    Ok(())
                } else {
                    Err(BreakerRejection::Open)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerRejection::ProbeLimit)
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    debug!(node = %self.node, "circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    inner.half_open_in_flight = 0;
                    inner.last_state_change_at = now;
                }
            }
            CircuitState::Open => {
                // A success reported while open can only come from a call
                // admitted before the circuit opened; ignore it.
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    debug!(node = %self.node, failures = inner.failures, "circuit breaker opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.last_state_change_at = now;
                }
            }
            CircuitState::HalfOpen => {
                debug!(node = %self.node, "circuit breaker re-opened from half-open");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = 0;
                inner.last_state_change_at = now;
            }
            CircuitState::Open => {}
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Point-in-time snapshot
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            successes: inner.consecutive_successes,
            last_state_change_at: inner.last_state_change_at,
            half_open_attempts: inner.half_open_in_flight,
        }
    }
}

/// Registry of breakers keyed by node name
///
/// Breakers are in-memory and node-scoped; different nodes are fully
/// independent.
pub struct CircuitBreakerRegistry {
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Get or create the breaker for a node
    pub fn breaker(&self, node: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(node.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    node,
                    config.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    /// Look up an existing breaker
    pub fn get(&self, node: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(node).map(|b| Arc::clone(&b))
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
