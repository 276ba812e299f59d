//! Retry policy implementation
//!
//! Fixed, linear and exponential backoff with optional jitter and a delay
//! cap. Specific error classes can be marked non-retryable and escape the
//! attempt loop immediately.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,

    /// `delay * n` before the nth retry
    Linear,

    /// `delay * multiplier^(n-1)` before the nth retry
    Exponential,
}

/// Configuration for node retries
///
/// # Example
///
/// ```
/// use windlass_core::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_millis(10));
///
/// // First retry after ~10ms, second after ~20ms, third after ~40ms...
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Base delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff strategy
    pub backoff: Backoff,

    /// Multiplier for exponential backoff
    pub multiplier: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means up to 10% of the delay either way.
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults
    ///
    /// - 3 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x multiplier, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff: Backoff::Exponential,
            multiplier: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Linear backoff: the nth retry waits `interval * n`
    pub fn linear(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: Duration::from_secs(60),
            backoff: Backoff::Linear,
            multiplier: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff: Backoff::Fixed,
            multiplier: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff: Backoff::Fixed,
            multiplier: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the exponential multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay before the given attempt number (1-based)
    ///
    /// Attempt 1 is the initial call and has no delay; attempt `n > 1`
    /// waits according to the backoff strategy.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = match self.backoff {
            Backoff::Fixed => self.initial_interval.as_secs_f64(),
            Backoff::Linear => self.initial_interval.as_secs_f64() * retry_num as f64,
            Backoff::Exponential => {
                self.initial_interval.as_secs_f64() * self.multiplier.powi(retry_num as i32 - 1)
            }
        };
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..=jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self
                .non_retryable_errors
                .iter()
                .any(|t| t == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
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

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::linear(Duration::from_millis(100), 5);

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(10))
            .with_jitter(0.1);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2).as_secs_f64();
            assert!((9.0..=11.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("invalid_input")
            .with_non_retryable_error("not_found");

        assert!(!policy.should_retry(Some("invalid_input")));
        assert!(!policy.should_retry(Some("not_found")));
        assert!(policy.should_retry(Some("timeout")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::linear(Duration::from_millis(50), 4)
            .with_non_retryable_error("bad_request");

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
