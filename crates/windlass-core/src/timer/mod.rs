//! Timer subsystem
//!
//! A timer suspends a run's node until an absolute instant. The store
//! guards delivery with an atomic pending-to-fired transition, so a timer
//! fires at most once even with several polling workers; the manager
//! polls for due entries and hands them to a resume handler.

mod cron;

pub use cron::{parse_timezone, CronError, CronSchedule};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::model::RunState;

/// How a timer's fire time was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// `now + delay`
    Fixed,

    /// `now + compute(state)`, recomputed at entry
    Dynamic,

    /// Next occurrence of a cron expression in a named timezone
    Cron,

    /// An absolute instant
    Until,
}

/// Delivery status of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    /// Waiting to fire
    Pending,

    /// Fired (never re-fired)
    Fired,

    /// Cancelled before firing
    Cancelled,
}

/// A stored timer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerEntry {
    /// Timer id, sortable by creation time
    pub id: Uuid,

    /// Run waiting on this timer
    pub run_id: Uuid,

    /// Node that owns the wait
    pub node: String,

    /// Absolute fire instant
    pub fire_at: DateTime<Utc>,

    /// How the fire time was derived
    pub kind: TimerKind,

    /// Source expression for cron timers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,

    /// Timezone name for cron timers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Delivery status
    pub status: TimerStatus,

    /// When the entry was created
    pub created_at: DateTime<Utc>,
}

impl TimerEntry {
    /// Create a pending entry
    pub fn new(run_id: Uuid, node: impl Into<String>, fire_at: DateTime<Utc>, kind: TimerKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            node: node.into(),
            fire_at,
            kind,
            cron_expr: None,
            timezone: None,
            status: TimerStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Configuration record for a timer node
#[derive(Clone)]
pub enum TimerNodeConfig {
    /// Wait a fixed delay from entry
    Fixed {
        /// Delay from entry
        delay: Duration,
    },

    /// Wait a delay computed from the state at entry
    Dynamic {
        /// Delay computation
        compute: Arc<dyn Fn(&RunState) -> Duration + Send + Sync>,
    },

    /// Wait for the next occurrence of a cron schedule
    Cron {
        /// Parsed schedule
        schedule: CronSchedule,
        /// Timezone name (IANA)
        timezone: String,
    },

    /// Wait until an absolute instant
    Until {
        /// Absolute wake-up time
        at: DateTime<Utc>,
    },
}

impl TimerNodeConfig {
    /// Fixed-delay wait
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// State-derived wait
    pub fn dynamic<F>(compute: F) -> Self
    where
        F: Fn(&RunState) -> Duration + Send + Sync + 'static,
    {
        Self::Dynamic {
            compute: Arc::new(compute),
        }
    }

    /// Cron wait in a named timezone
    pub fn cron(expr: &str, timezone: &str) -> Result<Self, CronError> {
        parse_timezone(timezone)?;
        Ok(Self::Cron {
            schedule: CronSchedule::parse(expr)?,
            timezone: timezone.to_string(),
        })
    }

    /// Absolute wait
    pub fn until(at: DateTime<Utc>) -> Self {
        Self::Until { at }
    }

    /// The timer kind this config produces
    pub fn kind(&self) -> TimerKind {
        match self {
            Self::Fixed { .. } => TimerKind::Fixed,
            Self::Dynamic { .. } => TimerKind::Dynamic,
            Self::Cron { .. } => TimerKind::Cron,
            Self::Until { .. } => TimerKind::Until,
        }
    }

    /// Resolve the absolute fire time at node entry
    pub fn fire_at(&self, state: &RunState, now: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        match self {
            Self::Fixed { delay } => Ok(now
                + chrono::TimeDelta::from_std(*delay)
                    .map_err(|e| EngineError::Configuration(e.to_string()))?),
            Self::Dynamic { compute } => {
                let delay = compute(state);
                Ok(now
                    + chrono::TimeDelta::from_std(delay)
                        .map_err(|e| EngineError::Configuration(e.to_string()))?)
            }
            Self::Cron { schedule, timezone } => {
                let tz = parse_timezone(timezone)
                    .map_err(|e| EngineError::Configuration(e.to_string()))?;
                schedule.next_after(now, tz).ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "cron expression {} never fires",
                        schedule.expression()
                    ))
                })
            }
            Self::Until { at } => Ok(*at),
        }
    }

    /// Build a pending entry for a run's node
    pub fn build_entry(
        &self,
        run_id: Uuid,
        node: &str,
        state: &RunState,
        now: DateTime<Utc>,
    ) -> Result<TimerEntry, EngineError> {
        let mut entry = TimerEntry::new(run_id, node, self.fire_at(state, now)?, self.kind());
        if let Self::Cron { schedule, timezone } = self {
            entry.cron_expr = Some(schedule.expression().to_string());
            entry.timezone = Some(timezone.clone());
        }
        Ok(entry)
    }
}

impl std::fmt::Debug for TimerNodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed { delay } => write!(f, "TimerNodeConfig::Fixed({delay:?})"),
            Self::Dynamic { .. } => write!(f, "TimerNodeConfig::Dynamic"),
            Self::Cron { schedule, timezone } => {
                write!(f, "TimerNodeConfig::Cron({schedule}, {timezone})")
            }
            Self::Until { at } => write!(f, "TimerNodeConfig::Until({at})"),
        }
    }
}

/// Store for timers
///
/// `mark_fired` is the delivery guard: an atomic pending-to-fired
/// transition that succeeds exactly once per timer.
#[async_trait]
pub trait TimerStore: Send + Sync + 'static {
    /// Enqueue a pending timer
    ///
    /// At most one pending timer exists per (run, node); an existing
    /// pending entry for the pair is cancelled first.
    async fn enqueue(&self, entry: TimerEntry) -> Result<Uuid, EngineError>;

    /// Pending timers due at or before `now`
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TimerEntry>, EngineError>;

    /// Claim a timer for delivery; returns false if it was not pending
    async fn mark_fired(&self, id: Uuid) -> Result<bool, EngineError>;

    /// Cancel a pending timer; returns false if it was not pending
    async fn cancel(&self, id: Uuid) -> Result<bool, EngineError>;

    /// Look up a timer
    async fn get(&self, id: Uuid) -> Result<Option<TimerEntry>, EngineError>;
}

/// In-memory implementation of [`TimerStore`]
#[derive(Default)]
pub struct InMemoryTimerStore {
    entries: RwLock<HashMap<Uuid, TimerEntry>>,
}

impl InMemoryTimerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending timers
    pub fn pending_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == TimerStatus::Pending)
            .count()
    }
}

#[async_trait]
impl TimerStore for InMemoryTimerStore {
    async fn enqueue(&self, entry: TimerEntry) -> Result<Uuid, EngineError> {
        let id = entry.id;
        let mut entries = self.entries.write();
        for existing in entries.values_mut() {
            if existing.status == TimerStatus::Pending
                && existing.run_id == entry.run_id
                && existing.node == entry.node
            {
                existing.status = TimerStatus::Cancelled;
            }
        }
        entries.insert(id, entry);
        Ok(id)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TimerEntry>, EngineError> {
        let entries = self.entries.read();
        let mut due: Vec<TimerEntry> = entries
            .values()
            .filter(|e| e.status == TimerStatus::Pending && e.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn mark_fired(&self, id: Uuid) -> Result<bool, EngineError> {
        let mut entries = self.entries.write();
        match entries.get_mut(&id) {
            Some(entry) if entry.status == TimerStatus::Pending => {
                entry.status = TimerStatus::Fired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, EngineError> {
        let mut entries = self.entries.write();
        match entries.get_mut(&id) {
            Some(entry) if entry.status == TimerStatus::Pending => {
                entry.status = TimerStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<TimerEntry>, EngineError> {
        Ok(self.entries.read().get(&id).cloned())
    }
}

/// Handler invoked for each fired timer
pub type TimerHandler = Arc<dyn Fn(TimerEntry) -> BoxFuture<'static, ()> + Send + Sync>;

/// Timer manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimerManagerConfig {
    /// Poll interval; firing lag is bounded by this
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for TimerManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl TimerManagerConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Polls the store and delivers due timers
///
/// # Example
///
/// ```ignore
/// let manager = TimerManager::new(store, clock, TimerManagerConfig::default())
///     .on_fire(|entry| async move { resume_run(entry).await });
/// manager.start();
/// // ... later
/// manager.shutdown().await;
/// ```
pub struct TimerManager {
    store: Arc<dyn TimerStore>,
    clock: Arc<dyn Clock>,
    config: TimerManagerConfig,
    handler: RwLock<Option<TimerHandler>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TimerManager {
    /// Create a manager over a store
    pub fn new(store: Arc<dyn TimerStore>, clock: Arc<dyn Clock>, config: TimerManagerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            clock,
            config,
            handler: RwLock::new(None),
            shutdown_tx,
            shutdown_rx,
            poll_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Set the fire handler
    pub fn on_fire<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(TimerEntry) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        *self.handler.write() = Some(Arc::new(move |entry| Box::pin(handler(entry))));
        self
    }

    /// Fire all currently due timers once, returning how many fired
    ///
    /// The claim through [`TimerStore::mark_fired`] makes this safe to
    /// call from several workers; each timer is delivered at most once.
    pub async fn poll_once(&self) -> Result<usize, EngineError> {
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            return Ok(0);
        };
        fire_due(&self.store, &self.clock, &handler).await
    }

    /// Start the polling loop
    #[instrument(skip(self))]
    pub fn start(&self) {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let handler = self.handler.read().clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.poll_interval;

        let handle = tokio::spawn(async move {
            info!(poll_interval_ms = interval.as_millis() as u64, "timer manager started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(handler) = &handler {
                            if let Err(e) = fire_due(&store, &clock, handler).await {
                                error!("timer poll failed: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("timer manager: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Stop the polling loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.poll_handle.lock().take() {
            let _ = handle.await;
        }
        info!("timer manager stopped");
    }
}

/// Claim and deliver every due timer once
async fn fire_due(
    store: &Arc<dyn TimerStore>,
    clock: &Arc<dyn Clock>,
    handler: &TimerHandler,
) -> Result<usize, EngineError> {
    let now = clock.now();
    let due = store.due(now).await?;
    let mut fired = 0;

    for entry in due {
        if store.mark_fired(entry.id).await? {
            debug!(timer_id = %entry.id, run_id = %entry.run_id, "timer fired");
            handler(entry).await;
            fired += 1;
        }
    }
    Ok(fired)
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
