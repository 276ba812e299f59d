//! Engine configuration
//!
//! One record aggregating every component's options. All config records
//! enumerate their recognized fields explicitly and reject unknown keys,
//! so a typo in deployment config fails loudly instead of silently
//! falling back to a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::ExecutorConfig;
use crate::runs::{MaintenanceConfig, RunManagerConfig};
use crate::timer::TimerManagerConfig;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Executor options
    pub executor: ExecutorConfig,

    /// Run manager options
    pub run_manager: RunManagerConfig,

    /// Timer manager options
    pub timers: TimerManagerConfig,

    /// Maintenance options
    pub maintenance: MaintenanceConfig,

    /// Idempotency record TTL (default 24h)
    #[serde(with = "duration_millis")]
    pub idempotency_ttl: Duration,
}

impl EngineConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON document
    pub fn from_json(json: &str) -> Result<Self, crate::error::EngineError> {
        serde_json::from_str(json)
            .map_err(|e| crate::error::EngineError::Configuration(e.to_string()))
    }

    /// Set the executor options
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Set the run manager options
    pub fn with_run_manager(mut self, run_manager: RunManagerConfig) -> Self {
        self.run_manager = run_manager;
        self
    }

    /// Set the timer options
    pub fn with_timers(mut self, timers: TimerManagerConfig) -> Self {
        self.timers = timers;
        self
    }

    /// Set the idempotency record TTL
    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }
}

const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            run_manager: RunManagerConfig::default(),
            timers: TimerManagerConfig::default(),
            maintenance: MaintenanceConfig::default(),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
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

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.max_concurrency, 4);
        assert_eq!(config.run_manager.max_concurrent_runs, 4);
        assert_eq!(config.idempotency_ttl, DEFAULT_IDEMPOTENCY_TTL);
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig::new()
            .with_idempotency_ttl(Duration::from_secs(3600));
        let json = serde_json::to_string(&config).unwrap();
        let parsed = EngineConfig::from_json(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = EngineConfig::from_json(r#"{"executer": {}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"idempotency_ttl": 1000}"#).unwrap();
        assert_eq!(config.idempotency_ttl, Duration::from_millis(1000));
        assert_eq!(config.executor.max_iterations, 100);
    }
}
