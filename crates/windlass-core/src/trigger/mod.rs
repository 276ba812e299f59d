//! Triggers: external signals that create runs
//!
//! Cron triggers fire on a schedule, webhook triggers validate and admit
//! HTTP-shaped requests, and event triggers bind in-process event names
//! to workflows. All of them enqueue runs at the run manager.

mod rate_limit;
mod webhook;

pub use rate_limit::{SlidingWindowConfig, SlidingWindowLimiter, TokenBucket, TokenBucketConfig};
pub use webhook::{sign, verify_signature, WebhookRequest, SIGNATURE_HEADER};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::model::StatePatch;
use crate::runs::RunManager;
use crate::timer::{parse_timezone, CronSchedule};

/// Errors from trigger handling
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// No trigger registered under that name
    #[error("unknown trigger: {0}")]
    UnknownTrigger(String),

    /// Webhook signature missing or wrong
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Admission rejected by the rate limiter
    #[error("rate limited")]
    RateLimited,

    /// Engine-level failure while enqueueing
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A stored cron trigger
#[derive(Debug, Clone)]
pub struct CronTrigger {
    /// Trigger id
    pub id: Uuid,

    /// Workflow runs are created for
    pub workflow_name: String,

    /// Schedule
    pub schedule: CronSchedule,

    /// Timezone name
    pub timezone: String,

    /// Next computed fire instant
    pub next_fire: DateTime<Utc>,

    /// Whether the trigger is active
    pub enabled: bool,
}

/// Webhook trigger options
#[derive(Default)]
pub struct WebhookTriggerConfig {
    /// Shared secret for HMAC-SHA256 verification
    pub secret: Option<String>,

    /// Token-bucket admission
    pub rate_limit: Option<TokenBucketConfig>,
}

impl WebhookTriggerConfig {
    /// Create an open webhook (no signature, no rate limit)
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a valid HMAC-SHA256 signature
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Gate admission through a token bucket
    pub fn with_rate_limit(mut self, config: TokenBucketConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }
}

struct WebhookTrigger {
    workflow_name: String,
    secret: Option<String>,
    bucket: Option<TokenBucket>,
}

/// Creates runs from cron schedules, webhooks and events
pub struct TriggerManager {
    runs: Arc<RunManager>,
    clock: Arc<dyn Clock>,
    cron: Arc<RwLock<HashMap<Uuid, CronTrigger>>>,
    webhooks: RwLock<HashMap<String, WebhookTrigger>>,
    events: RwLock<HashMap<String, Vec<String>>>,
    poll_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerManager {
    /// Create a manager enqueueing at the given run manager
    pub fn new(runs: Arc<RunManager>, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            runs,
            clock,
            cron: Arc::new(RwLock::new(HashMap::new())),
            webhooks: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            poll_interval: Duration::from_millis(500),
            shutdown_tx,
            shutdown_rx,
            poll_handle: Mutex::new(None),
        }
    }

    /// Set the cron poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    // =========================================================================
    // Cron triggers
    // =========================================================================

    /// Register a cron trigger
    pub fn register_cron(
        &self,
        workflow_name: impl Into<String>,
        expr: &str,
        timezone: &str,
    ) -> Result<Uuid, EngineError> {
        let schedule =
            CronSchedule::parse(expr).map_err(|e| EngineError::Configuration(e.to_string()))?;
        let tz = parse_timezone(timezone)
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let next_fire = schedule.next_after(self.clock.now(), tz).ok_or_else(|| {
            EngineError::Configuration(format!("cron expression {expr} never fires"))
        })?;

        let trigger = CronTrigger {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            schedule,
            timezone: timezone.to_string(),
            next_fire,
            enabled: true,
        };
        let id = trigger.id;
        info!(trigger_id = %id, workflow = %trigger.workflow_name, expr, "cron trigger registered");
        self.cron.write().insert(id, trigger);
        Ok(id)
    }

    /// Enable or disable a cron trigger
    pub fn set_cron_enabled(&self, id: Uuid, enabled: bool) -> Result<(), EngineError> {
        let mut cron = self.cron.write();
        let trigger = cron
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("cron trigger {id}")))?;
        trigger.enabled = enabled;
        Ok(())
    }

    /// Look up a cron trigger
    pub fn cron_trigger(&self, id: Uuid) -> Option<CronTrigger> {
        self.cron.read().get(&id).cloned()
    }

    /// Fire all due cron triggers once, returning the created run ids
    pub async fn poll_cron_once(&self) -> Result<Vec<Uuid>, EngineError> {
        poll_cron(&self.cron, &self.runs, self.clock.now()).await
    }

    /// Start the cron polling loop
    pub fn start(&self) {
        let cron = Arc::clone(&self.cron);
        let runs = Arc::clone(&self.runs);
        let clock = Arc::clone(&self.clock);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            info!(poll_interval_ms = interval.as_millis() as u64, "trigger scheduler started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = poll_cron(&cron, &runs, clock.now()).await {
                            error!("cron poll failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("trigger scheduler: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Stop the cron polling loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.poll_handle.lock().take() {
            let _ = handle.await;
        }
    }

    // =========================================================================
    // Webhook triggers
    // =========================================================================

    /// Register a webhook trigger under a name
    pub fn register_webhook(
        &self,
        name: impl Into<String>,
        workflow_name: impl Into<String>,
        config: WebhookTriggerConfig,
    ) {
        let name = name.into();
        let trigger = WebhookTrigger {
            workflow_name: workflow_name.into(),
            secret: config.secret,
            bucket: config
                .rate_limit
                .map(|c| TokenBucket::new(c, Arc::clone(&self.clock))),
        };
        info!(webhook = %name, workflow = %trigger.workflow_name, "webhook trigger registered");
        self.webhooks.write().insert(name, trigger);
    }

    /// Handle an incoming webhook request
    ///
    /// Validates the signature (when a secret is configured), takes a
    /// rate-limit token (when configured), and enqueues a run with the
    /// request body as input.
    pub async fn handle_webhook(
        &self,
        name: &str,
        request: WebhookRequest,
    ) -> Result<Uuid, TriggerError> {
        let (workflow_name, verified) = {
            let webhooks = self.webhooks.read();
            let trigger = webhooks
                .get(name)
                .ok_or_else(|| TriggerError::UnknownTrigger(name.to_string()))?;

            if let Some(secret) = &trigger.secret {
                let valid = request
                    .signature()
                    .map(|sig| verify_signature(secret, &request.body, sig))
                    .unwrap_or(false);
                if !valid {
                    warn!(webhook = %name, "webhook signature rejected");
                    return Err(TriggerError::InvalidSignature);
                }
            }
            if let Some(bucket) = &trigger.bucket {
                if !bucket.try_acquire() {
                    return Err(TriggerError::RateLimited);
                }
            }
            (trigger.workflow_name.clone(), trigger.secret.is_some())
        };

        let mut input = StatePatch::new();
        input.insert("trigger".to_string(), json!("webhook"));
        input.insert("webhook".to_string(), json!(name));
        input.insert("verified".to_string(), json!(verified));
        input.insert(
            "body".to_string(),
            request.body_json().unwrap_or(serde_json::Value::Null),
        );
        // Trace context crosses the trigger boundary with the request.
        if let Some(traceparent) = request.headers.get("traceparent") {
            input.insert("traceparent".to_string(), json!(traceparent));
        }

        let run_id = self.runs.enqueue(&workflow_name, Some(input), 0).await?;
        debug!(webhook = %name, %run_id, "webhook trigger fired");
        Ok(run_id)
    }

    // =========================================================================
    // Event triggers
    // =========================================================================

    /// Bind an event name to a workflow
    pub fn register_event(&self, event: impl Into<String>, workflow_name: impl Into<String>) {
        self.events
            .write()
            .entry(event.into())
            .or_default()
            .push(workflow_name.into());
    }

    /// Emit an event, enqueueing a run per bound workflow
    pub async fn emit(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<Uuid>, EngineError> {
        let workflows = self
            .events
            .read()
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut created = Vec::with_capacity(workflows.len());
        for workflow_name in workflows {
            let mut input = StatePatch::new();
            input.insert("trigger".to_string(), json!("event"));
            input.insert("event".to_string(), json!(event));
            input.insert("payload".to_string(), payload.clone());
            created.push(self.runs.enqueue(&workflow_name, Some(input), 0).await?);
        }
        debug!(event, runs = created.len(), "event emitted");
        Ok(created)
    }
}

/// Fire every due cron trigger once
async fn poll_cron(
    cron: &Arc<RwLock<HashMap<Uuid, CronTrigger>>>,
    runs: &Arc<RunManager>,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, EngineError> {
    let due: Vec<(Uuid, String, DateTime<Utc>)> = {
        let cron = cron.read();
        cron.values()
            .filter(|t| t.enabled && t.next_fire <= now)
            .map(|t| (t.id, t.workflow_name.clone(), t.next_fire))
            .collect()
    };

    let mut created = Vec::new();
    for (id, workflow_name, fired_at) in due {
        let mut input = StatePatch::new();
        input.insert("trigger".to_string(), json!("cron"));
        input.insert("fired_at".to_string(), json!(fired_at));

        match runs.enqueue(&workflow_name, Some(input), 0).await {
            Ok(run_id) => {
                debug!(trigger_id = %id, %run_id, "cron trigger fired");
                created.push(run_id);
            }
            Err(e) => error!(trigger_id = %id, "cron trigger enqueue failed: {e}"),
        }

        // Advance the schedule even when the enqueue failed, so a bad
        // registration cannot fire in a tight loop.
        let mut cron = cron.write();
        if let Some(trigger) = cron.get_mut(&id) {
            if let Ok(tz) = parse_timezone(&trigger.timezone) {
                match trigger.schedule.next_after(now, tz) {
                    Some(next) => trigger.next_fire = next,
                    None => trigger.enabled = false,
                }
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::{Executor, ExecutorConfig};
    use crate::model::{NodeDef, NodeOutput, RunStatus, Workflow};
    use crate::runs::{InMemoryRunStore, RunFilter, RunManagerConfig};
    use crate::reliability::Pagination;

    fn workflow(name: &str) -> Arc<Workflow> {
        Workflow::builder(name)
            .add_node(NodeDef::function("work", |_| async {
                Ok(NodeOutput::empty())
            }))
            .entry_point("work")
            .build()
            .unwrap()
    }

    fn setup() -> (Arc<RunManager>, Arc<ManualClock>, TriggerManager) {
        let executor = Arc::new(Executor::new(ExecutorConfig::default()));
        let runs = Arc::new(RunManager::new(
            executor,
            Arc::new(InMemoryRunStore::new()),
            RunManagerConfig::default(),
        ));
        runs.register_workflow(workflow("target"));
        let clock = Arc::new(ManualClock::new());
        let triggers = TriggerManager::new(runs.clone(), clock.clone());
        (runs, clock, triggers)
    }

    #[tokio::test]
    async fn test_cron_trigger_fires_when_due() {
        let (runs, clock, triggers) = setup();
        let id = triggers
            .register_cron("target", "*/5 * * * *", "UTC")
            .unwrap();

        // Not yet due.
        assert!(triggers.poll_cron_once().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(5 * 60));
        let created = triggers.poll_cron_once().await.unwrap();
        assert_eq!(created.len(), 1);

        let run = runs.get_run(created[0]).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.state.get_str("trigger"), Some("cron"));

        // The next fire time advanced.
        let trigger = triggers.cron_trigger(id).unwrap();
        assert!(trigger.next_fire > clock.now());
    }

    #[tokio::test]
    async fn test_cron_trigger_disabled() {
        let (_runs, clock, triggers) = setup();
        let id = triggers
            .register_cron("target", "* * * * *", "UTC")
            .unwrap();
        triggers.set_cron_enabled(id, false).unwrap();

        clock.advance(Duration::from_secs(120));
        assert!(triggers.poll_cron_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cron_rejects_bad_expression() {
        let (_runs, _clock, triggers) = setup();
        assert!(triggers.register_cron("target", "bad", "UTC").is_err());
        assert!(triggers
            .register_cron("target", "* * * * *", "Nowhere/Invalid")
            .is_err());
    }

    #[tokio::test]
    async fn test_webhook_enqueues_with_body() {
        let (runs, _clock, triggers) = setup();
        triggers.register_webhook("orders", "target", WebhookTriggerConfig::new());

        let run_id = triggers
            .handle_webhook("orders", WebhookRequest::new(br#"{"order": 7}"#.to_vec()))
            .await
            .unwrap();

        let run = runs.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.state.get("body").unwrap()["order"], 7);
        assert_eq!(run.state.get_str("trigger"), Some("webhook"));
    }

    #[tokio::test]
    async fn test_webhook_signature_enforced() {
        let (_runs, _clock, triggers) = setup();
        triggers.register_webhook(
            "secure",
            "target",
            WebhookTriggerConfig::new().with_secret("hunter2"),
        );

        let body = br#"{"x": 1}"#.to_vec();

        // Missing signature.
        let result = triggers
            .handle_webhook("secure", WebhookRequest::new(body.clone()))
            .await;
        assert!(matches!(result, Err(TriggerError::InvalidSignature)));

        // Wrong signature.
        let result = triggers
            .handle_webhook(
                "secure",
                WebhookRequest::new(body.clone()).with_header(SIGNATURE_HEADER, "sha256=00ff"),
            )
            .await;
        assert!(matches!(result, Err(TriggerError::InvalidSignature)));

        // Correct signature.
        let signature = sign("hunter2", &body);
        let result = triggers
            .handle_webhook(
                "secure",
                WebhookRequest::new(body).with_header(SIGNATURE_HEADER, signature),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_rate_limit() {
        let (_runs, _clock, triggers) = setup();
        triggers.register_webhook(
            "busy",
            "target",
            WebhookTriggerConfig::new().with_rate_limit(TokenBucketConfig::new(2, 0.0)),
        );

        for _ in 0..2 {
            triggers
                .handle_webhook("busy", WebhookRequest::new(b"{}".to_vec()))
                .await
                .unwrap();
        }
        let result = triggers
            .handle_webhook("busy", WebhookRequest::new(b"{}".to_vec()))
            .await;
        assert!(matches!(result, Err(TriggerError::RateLimited)));
    }

    #[tokio::test]
    async fn test_unknown_webhook() {
        let (_runs, _clock, triggers) = setup();
        let result = triggers
            .handle_webhook("ghost", WebhookRequest::new(b"{}".to_vec()))
            .await;
        assert!(matches!(result, Err(TriggerError::UnknownTrigger(_))));
    }

    #[tokio::test]
    async fn test_event_trigger_fans_out() {
        let (runs, _clock, triggers) = setup();
        runs.register_workflow(workflow("second"));
        triggers.register_event("order.created", "target");
        triggers.register_event("order.created", "second");

        let created = triggers
            .emit("order.created", json!({"order": 9}))
            .await
            .unwrap();
        assert_eq!(created.len(), 2);

        let queued = runs
            .list_runs(
                RunFilter::status(RunStatus::Queued),
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert!(queued
            .iter()
            .all(|r| r.state.get("payload").unwrap()["order"] == 9));
    }

    #[tokio::test]
    async fn test_emit_unbound_event_is_noop() {
        let (_runs, _clock, triggers) = setup();
        let created = triggers.emit("nobody.cares", json!({})).await.unwrap();
        assert!(created.is_empty());
    }
}
