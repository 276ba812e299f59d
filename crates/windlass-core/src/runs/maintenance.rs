//! Maintenance scheduler
//!
//! Periodic housekeeping ticks: dead-letter retention cleanup, the
//! idempotency TTL sweep, and removal of old resolved approvals. This
//! is internal scheduling, unrelated to cron triggers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::approval::ApprovalStore;
use crate::clock::Clock;
use crate::error::EngineError;
use crate::reliability::{DeadLetterQueue, IdempotencyStore};

/// Maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Tick interval (default 60s)
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Dead-letter entries older than this are removed (default 7 days)
    #[serde(with = "duration_millis")]
    pub dlq_retention: Duration,

    /// Resolved approvals older than this are removed (default 24h)
    #[serde(with = "duration_millis")]
    pub approval_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            dlq_retention: Duration::from_secs(7 * 24 * 3600),
            approval_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl MaintenanceConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tick interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the dead-letter retention window
    pub fn with_dlq_retention(mut self, retention: Duration) -> Self {
        self.dlq_retention = retention;
        self
    }

    /// Set the resolved-approval retention window
    pub fn with_approval_retention(mut self, retention: Duration) -> Self {
        self.approval_retention = retention;
        self
    }
}

/// What one tick cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Dead-letter entries removed
    pub dlq_removed: usize,

    /// Idempotency records swept
    pub idempotency_swept: usize,

    /// Resolved approvals removed
    pub approvals_removed: usize,
}

/// Runs housekeeping on an interval
pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    clock: Arc<dyn Clock>,
    dlq: Option<Arc<dyn DeadLetterQueue>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    approvals: Option<Arc<dyn ApprovalStore>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    /// Create a scheduler with nothing attached
    pub fn new(config: MaintenanceConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            clock,
            dlq: None,
            idempotency: None,
            approvals: None,
            shutdown_tx,
            shutdown_rx,
            tick_handle: Mutex::new(None),
        }
    }

    /// Sweep this dead-letter queue
    pub fn with_dead_letter_queue(mut self, dlq: Arc<dyn DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Sweep this idempotency store
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    /// Sweep this approval store
    pub fn with_approval_store(mut self, store: Arc<dyn ApprovalStore>) -> Self {
        self.approvals = Some(store);
        self
    }

    /// Run one maintenance tick
    pub async fn tick_once(&self) -> Result<MaintenanceReport, EngineError> {
        sweep(
            &self.config,
            self.clock.now(),
            self.dlq.as_ref(),
            self.idempotency.as_ref(),
            self.approvals.as_ref(),
        )
        .await
    }

    /// Start the tick loop
    pub fn start(&self) {
        let config = self.config.clone();
        let clock = Arc::clone(&self.clock);
        let dlq = self.dlq.clone();
        let idempotency = self.idempotency.clone();
        let approvals = self.approvals.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "maintenance started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let result = sweep(
                            &config,
                            clock.now(),
                            dlq.as_ref(),
                            idempotency.as_ref(),
                            approvals.as_ref(),
                        )
                        .await;
                        if let Err(e) = result {
                            error!("maintenance tick failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("maintenance: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.tick_handle.lock() = Some(handle);
    }

    /// Stop the tick loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.tick_handle.lock().take() {
            let _ = handle.await;
        }
    }
}

/// One pass over every attached store
async fn sweep(
    config: &MaintenanceConfig,
    now: chrono::DateTime<chrono::Utc>,
    dlq: Option<&Arc<dyn DeadLetterQueue>>,
    idempotency: Option<&Arc<dyn IdempotencyStore>>,
    approvals: Option<&Arc<dyn ApprovalStore>>,
) -> Result<MaintenanceReport, EngineError> {
    let mut report = MaintenanceReport::default();

    if let Some(dlq) = dlq {
        let cutoff = now - chrono::TimeDelta::from_std(config.dlq_retention).unwrap_or(chrono::TimeDelta::zero());
        report.dlq_removed = dlq.remove_older_than(cutoff).await?;
    }
    if let Some(store) = idempotency {
        report.idempotency_swept = store.sweep_expired().await?;
    }
    if let Some(store) = approvals {
        let cutoff =
            now - chrono::TimeDelta::from_std(config.approval_retention).unwrap_or(chrono::TimeDelta::zero());
        report.approvals_removed = store.delete_resolved_before(cutoff).await?;
    }

    if report != MaintenanceReport::default() {
        debug!(
            dlq = report.dlq_removed,
            idempotency = report.idempotency_swept,
            approvals = report.approvals_removed,
            "maintenance tick cleaned up"
        );
    }
    Ok(report)
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
