//! Admission rate limiting
//!
//! A token bucket with continuous refill and a sliding-window limiter.
//! Both take a clock so tests drive time manually.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Token bucket configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenBucketConfig {
    /// Maximum tokens the bucket holds
    pub capacity: u32,

    /// Tokens refilled per second (continuous)
    pub refill_per_second: f64,
}

impl TokenBucketConfig {
    /// Create a config
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Token bucket admission control
///
/// Each admission consumes one token; refill is continuous in time, so
/// the integer tokens available at any instant are
/// `floor(min(capacity, tokens + elapsed_seconds * rate))`.
///
/// # Example
///
/// ```
/// use windlass_core::trigger::{TokenBucket, TokenBucketConfig};
/// use windlass_core::clock::SystemClock;
///
/// let bucket = TokenBucket::new(TokenBucketConfig::new(10, 2.0), SystemClock::shared());
/// assert!(bucket.try_acquire());
/// ```
pub struct TokenBucket {
    config: TokenBucketConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: TokenBucketConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity as f64,
                last_refill: now,
            }),
            config,
            clock,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = (now - state.last_refill)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        state.tokens = (state.tokens + elapsed * self.config.refill_per_second)
            .min(self.config.capacity as f64);
        state.last_refill = now;
    }

    /// Consume one token if available
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens.floor() as u32
    }
}

/// Sliding window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlidingWindowConfig {
    /// Maximum admissions per window
    pub max_requests: u32,

    /// Window length in seconds
    pub window_seconds: u32,
}

impl SlidingWindowConfig {
    /// Create a config
    pub fn new(max_requests: u32, window_seconds: u32) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }
}

/// Admits at most K requests per sliding window
///
/// Timestamps older than the window are evicted on each admission check,
/// so the bound holds at every second boundary.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    clock: Arc<dyn Clock>,
    hits: Mutex<VecDeque<DateTime<Utc>>>,
}

impl SlidingWindowLimiter {
    /// Create an empty limiter
    pub fn new(config: SlidingWindowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    fn evict(&self, hits: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        let cutoff = now - chrono::TimeDelta::seconds(self.config.window_seconds as i64);
        while hits.front().is_some_and(|t| *t <= cutoff) {
            hits.pop_front();
        }
    }

    /// Admit one request if the window has room
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut hits = self.hits.lock();
        self.evict(&mut hits, now);
        if hits.len() < self.config.max_requests as usize {
            hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Admissions currently counted in the window
    pub fn current_count(&self) -> usize {
        let now = self.clock.now();
        let mut hits = self.hits.lock();
        self.evict(&mut hits, now);
        hits.len()
    }
}
