//! Clock abstraction
//!
//! Components whose behavior depends on "now" (token buckets, circuit
//! breakers, timer polling, idempotency TTLs) take a [`Clock`] so tests
//! can drive time manually instead of sleeping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

/// Source of time
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the given duration
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time backed by tokio sleeps
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a system clock
    pub fn new() -> Self {
        Self
    }

    /// A shared system clock
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for tests
///
/// `sleep` returns immediately after advancing the clock by the requested
/// duration, so code under test observes time passing without waiting.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock starting at the given instant
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Create a manual clock starting at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Advance the clock
    pub fn advance(&self, duration: Duration) {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::zero());
        let mut now = self.now.write();
        *now += delta;
    }

    /// Jump to an absolute instant (must not go backwards)
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.write();
        if instant > *now {
            *now = instant;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
