//! Human-in-the-loop approvals
//!
//! An approval node creates a long-lived request, notifies the assignee,
//! registers a waiter and suspends its run. The store records at most one
//! terminal response per request (first writer wins); deadlines map to a
//! configured timeout action (approve, reject, escalate, fail), and a
//! response can delegate to a new assignee without resolving the
//! original request.

mod notifier;

pub use notifier::{
    CollectingNotifier, CompositeNotifier, ConsoleNotifier, FilteredNotifier, Notifier,
    PriorityRoutedNotifier, WebhookNotifier,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;

/// Kinds of approval requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// Binary approve/reject
    ApproveReject,

    /// Pick one of several options
    Choice,

    /// Free-form text answer
    FreeForm,

    /// Numeric rating
    Rating,
}

/// Request priority, used by routing notifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// What to do when a request's deadline passes without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Synthesize a system approval
    Approve,

    /// Synthesize a system rejection
    Reject,

    /// Create a derived request addressed to `escalate_to`
    Escalate,

    /// Fail the waiting node with `approval_timeout`
    Fail,
}

/// Lifecycle status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a response
    Pending,

    /// A terminal response was recorded
    Responded,

    /// Deadline passed and the request was escalated
    Escalated,

    /// Deadline passed with `timeout_action = fail`
    TimedOut,
}

/// A decision carried by a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Approved
    Approve,

    /// Rejected
    Reject,

    /// One option chosen
    Choice {
        /// The chosen option
        value: String,
    },

    /// Free-form answer
    FreeForm {
        /// The answer text
        text: String,
    },

    /// Numeric rating
    Rating {
        /// The rating value
        value: u8,
    },
}

impl Decision {
    /// Whether this decision rejects the request
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject)
    }

    /// Whether this decision approves the request
    pub fn is_approve(&self) -> bool {
        matches!(self, Self::Approve)
    }
}

/// A long-lived approval request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request id, sortable by creation time
    pub id: Uuid,

    /// Workflow identity
    pub workflow_id: Uuid,

    /// Run waiting on this request
    pub run_id: Uuid,

    /// Node that owns the wait
    pub node: String,

    /// Kind of request
    pub request_type: ApprovalType,

    /// Short title
    pub title: String,

    /// Longer description
    #[serde(default)]
    pub description: String,

    /// Individual assignee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Assignee group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_group: Option<String>,

    /// Priority
    pub priority: ApprovalPriority,

    /// Response deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    /// What happens when the deadline passes
    pub timeout_action: TimeoutAction,

    /// Escalation target for `timeout_action = escalate`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<String>,

    /// Lifecycle status
    pub status: ApprovalStatus,

    /// Links to related requests (`delegated_from`, `escalated_from`)
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// When the request was created
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Create a pending approve/reject request
    pub fn new(
        workflow_id: Uuid,
        run_id: Uuid,
        node: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            run_id,
            node: node.into(),
            request_type: ApprovalType::ApproveReject,
            title: title.into(),
            description: String::new(),
            assignee: None,
            assignee_group: None,
            priority: ApprovalPriority::Normal,
            deadline: None,
            timeout_action: TimeoutAction::Fail,
            escalate_to: None,
            status: ApprovalStatus::Pending,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the request type
    pub fn with_type(mut self, request_type: ApprovalType) -> Self {
        self.request_type = request_type;
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the assignee
    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    /// Set the assignee group
    pub fn with_assignee_group(mut self, group: impl Into<String>) -> Self {
        self.assignee_group = Some(group.into());
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: ApprovalPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the timeout action
    pub fn with_timeout_action(mut self, action: TimeoutAction) -> Self {
        self.timeout_action = action;
        self
    }

    /// Set the escalation target
    pub fn with_escalate_to(mut self, target: impl Into<String>) -> Self {
        self.escalate_to = Some(target.into());
        self
    }
}

/// A response to an approval request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Request being answered
    pub request_id: Uuid,

    /// The decision
    pub decision: Decision,

    /// Who responded (opaque identifier)
    pub responded_by: String,

    /// When the response was recorded
    pub responded_at: DateTime<Utc>,

    /// Delegation target; when set, the request is not resolved and a
    /// derived request is created instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_to: Option<String>,
}

impl ApprovalResponse {
    /// Create a response
    pub fn new(request_id: Uuid, decision: Decision, responded_by: impl Into<String>) -> Self {
        Self {
            request_id,
            decision,
            responded_by: responded_by.into(),
            responded_at: Utc::now(),
            delegated_to: None,
        }
    }

    /// Delegate to another assignee instead of deciding
    pub fn delegate(request_id: Uuid, responded_by: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            request_id,
            decision: Decision::Approve,
            responded_by: responded_by.into(),
            responded_at: Utc::now(),
            delegated_to: Some(to.into()),
        }
    }
}

/// How a wait on a request ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalResolution {
    /// A terminal response arrived
    Responded(ApprovalResponse),

    /// The deadline passed with `timeout_action = fail`
    TimedOut,
}

/// Outcome of submitting a response
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The request is resolved
    Resolved,

    /// The response delegated; a derived request was created
    Delegated {
        /// The derived request's id
        new_request_id: Uuid,
    },
}

/// Configuration record for a human approval node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ApprovalNodeConfig {
    /// Request title
    pub title: String,

    /// Request description
    #[serde(default)]
    pub description: String,

    /// Kind of request
    #[serde(default = "default_request_type")]
    pub request_type: ApprovalType,

    /// Assignee
    #[serde(default)]
    pub assignee: Option<String>,

    /// Assignee group
    #[serde(default)]
    pub assignee_group: Option<String>,

    /// Priority
    #[serde(default = "default_priority")]
    pub priority: ApprovalPriority,

    /// Deadline relative to node entry, milliseconds
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Timeout action
    #[serde(default = "default_timeout_action")]
    pub timeout_action: TimeoutAction,

    /// Escalation target
    #[serde(default)]
    pub escalate_to: Option<String>,

    /// State field the decision is written to (default `decision`)
    #[serde(default = "default_decision_key")]
    pub decision_key: String,
}

fn default_request_type() -> ApprovalType {
    ApprovalType::ApproveReject
}

fn default_priority() -> ApprovalPriority {
    ApprovalPriority::Normal
}

fn default_timeout_action() -> TimeoutAction {
    TimeoutAction::Fail
}

fn default_decision_key() -> String {
    "decision".to_string()
}

impl ApprovalNodeConfig {
    /// Create a config with the given title
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            request_type: default_request_type(),
            assignee: None,
            assignee_group: None,
            priority: default_priority(),
            deadline_ms: None,
            timeout_action: default_timeout_action(),
            escalate_to: None,
            decision_key: default_decision_key(),
        }
    }

    /// Set the assignee
    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    /// Set a relative deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    /// Set the timeout action
    pub fn with_timeout_action(mut self, action: TimeoutAction) -> Self {
        self.timeout_action = action;
        self
    }

    /// Set the escalation target
    pub fn with_escalate_to(mut self, target: impl Into<String>) -> Self {
        self.escalate_to = Some(target.into());
        self
    }

    /// Build a request for a run's node at the given instant
    pub fn build_request(&self, workflow_id: Uuid, run_id: Uuid, node: &str, now: DateTime<Utc>) -> ApprovalRequest {
        let mut request = ApprovalRequest::new(workflow_id, run_id, node, self.title.clone())
            .with_type(self.request_type)
            .with_description(self.description.clone())
            .with_priority(self.priority)
            .with_timeout_action(self.timeout_action);
        request.assignee = self.assignee.clone();
        request.assignee_group = self.assignee_group.clone();
        request.escalate_to = self.escalate_to.clone();
        if let Some(ms) = self.deadline_ms {
            request.deadline = Some(now + chrono::TimeDelta::milliseconds(ms as i64));
        }
        request
    }
}

/// Store for approval requests and responses
///
/// `submit_response` is atomic: the first terminal response wins and
/// later duplicates are rejected with a conflict.
#[async_trait]
pub trait ApprovalStore: Send + Sync + 'static {
    /// Create a request
    async fn create(&self, request: ApprovalRequest) -> Result<Uuid, EngineError>;

    /// Look up a request
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, EngineError>;

    /// Pending requests assigned to the given assignee
    async fn pending_for(&self, assignee: &str) -> Result<Vec<ApprovalRequest>, EngineError>;

    /// Submit a response (first terminal response wins)
    async fn submit_response(
        &self,
        response: ApprovalResponse,
    ) -> Result<SubmitOutcome, EngineError>;

    /// The recorded response, if any
    async fn response(&self, request_id: Uuid) -> Result<Option<ApprovalResponse>, EngineError>;

    /// Register a waiter resolved when the request reaches a terminal
    /// resolution (a delegated response does not resolve waiters)
    fn register_waiter(&self, request_id: Uuid) -> oneshot::Receiver<ApprovalResolution>;

    /// Delete a request and its response
    async fn delete(&self, id: Uuid) -> Result<(), EngineError>;

    /// Pending requests whose deadline has passed
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, EngineError>;

    /// Update a request's status
    async fn set_status(&self, id: Uuid, status: ApprovalStatus) -> Result<(), EngineError>;

    /// Resolve a request without a responder (deadline fail path)
    async fn resolve_timed_out(&self, id: Uuid) -> Result<(), EngineError>;

    /// Delete resolved requests created before `cutoff`, returning the
    /// count removed
    async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError>;
}

/// In-memory implementation of [`ApprovalStore`]
#[derive(Default)]
pub struct InMemoryApprovalStore {
    requests: RwLock<HashMap<Uuid, ApprovalRequest>>,
    responses: RwLock<HashMap<Uuid, ApprovalResponse>>,
    waiters: Mutex<HashMap<Uuid, Vec<oneshot::Sender<ApprovalResolution>>>>,
}

impl InMemoryApprovalStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests
    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    /// Whether the store holds no requests
    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }

    fn fire_waiters(&self, request_id: Uuid, resolution: ApprovalResolution) {
        let waiters = self.waiters.lock().remove(&request_id).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(resolution.clone());
        }
    }

    /// Walk `delegated_from` links up to the original request, resolving
    /// each ancestor with the same response.
    fn resolve_ancestors(&self, request_id: Uuid, response: &ApprovalResponse) {
        let mut current = request_id;
        loop {
            let parent = {
                let requests = self.requests.read();
                requests.get(&current).and_then(|r| {
                    r.metadata
                        .get("delegated_from")
                        .or_else(|| r.metadata.get("escalated_from"))
                        .and_then(|s| s.parse::<Uuid>().ok())
                })
            };
            let Some(parent) = parent else { break };

            {
                let mut requests = self.requests.write();
                if let Some(request) = requests.get_mut(&parent) {
                    request.status = ApprovalStatus::Responded;
                }
                let mut parent_response = response.clone();
                parent_response.request_id = parent;
                self.responses
                    .write()
                    .entry(parent)
                    .or_insert(parent_response.clone());
                drop(requests);
                self.fire_waiters(parent, ApprovalResolution::Responded(parent_response));
            }
            current = parent;
        }
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn create(&self, request: ApprovalRequest) -> Result<Uuid, EngineError> {
        let id = request.id;
        self.requests.write().insert(id, request);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>, EngineError> {
        Ok(self.requests.read().get(&id).cloned())
    }

    async fn pending_for(&self, assignee: &str) -> Result<Vec<ApprovalRequest>, EngineError> {
        let requests = self.requests.read();
        let mut pending: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| {
                r.status == ApprovalStatus::Pending
                    && (r.assignee.as_deref() == Some(assignee)
                        || r.assignee_group.as_deref() == Some(assignee))
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(pending)
    }

    async fn submit_response(
        &self,
        response: ApprovalResponse,
    ) -> Result<SubmitOutcome, EngineError> {
        let request_id = response.request_id;

        // Delegation: derive a new request, leave the original pending.
        if let Some(ref delegate) = response.delegated_to {
            let derived = {
                let requests = self.requests.read();
                let original = requests
                    .get(&request_id)
                    .ok_or_else(|| EngineError::NotFound(format!("approval request {request_id}")))?;
                if original.status != ApprovalStatus::Pending {
                    return Err(EngineError::Conflict(format!(
                        "approval request {request_id} already resolved"
                    )));
                }
                let mut derived = original.clone();
                derived.id = Uuid::now_v7();
                derived.assignee = Some(delegate.clone());
                derived.assignee_group = None;
                derived.status = ApprovalStatus::Pending;
                derived.created_at = Utc::now();
                derived
                    .metadata
                    .insert("delegated_from".to_string(), request_id.to_string());
                derived
            };
            let new_request_id = derived.id;
            self.requests.write().insert(new_request_id, derived);
            return Ok(SubmitOutcome::Delegated { new_request_id });
        }

        // Terminal response: first writer wins.
        {
            let mut requests = self.requests.write();
            let request = requests
                .get_mut(&request_id)
                .ok_or_else(|| EngineError::NotFound(format!("approval request {request_id}")))?;
            if self.responses.read().contains_key(&request_id) {
                return Err(EngineError::Conflict(format!(
                    "approval request {request_id} already responded"
                )));
            }
            if matches!(request.status, ApprovalStatus::TimedOut) {
                return Err(EngineError::Conflict(format!(
                    "approval request {request_id} already timed out"
                )));
            }
            request.status = ApprovalStatus::Responded;
            self.responses.write().insert(request_id, response.clone());
        }

        self.fire_waiters(request_id, ApprovalResolution::Responded(response.clone()));
        self.resolve_ancestors(request_id, &response);
        Ok(SubmitOutcome::Resolved)
    }

    async fn response(&self, request_id: Uuid) -> Result<Option<ApprovalResponse>, EngineError> {
        Ok(self.responses.read().get(&request_id).cloned())
    }

    fn register_waiter(&self, request_id: Uuid) -> oneshot::Receiver<ApprovalResolution> {
        let (tx, rx) = oneshot::channel();

        // Resolve immediately when a terminal resolution already exists.
        if let Some(response) = self.responses.read().get(&request_id) {
            let _ = tx.send(ApprovalResolution::Responded(response.clone()));
            return rx;
        }
        if let Some(request) = self.requests.read().get(&request_id) {
            if request.status == ApprovalStatus::TimedOut {
                let _ = tx.send(ApprovalResolution::TimedOut);
                return rx;
            }
        }

        self.waiters.lock().entry(request_id).or_default().push(tx);
        rx
    }

    async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        self.requests.write().remove(&id);
        self.responses.write().remove(&id);
        self.waiters.lock().remove(&id);
        Ok(())
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self
            .requests
            .read()
            .values()
            .filter(|r| {
                r.status == ApprovalStatus::Pending
                    && r.deadline.is_some_and(|deadline| deadline <= now)
            })
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: Uuid, status: ApprovalStatus) -> Result<(), EngineError> {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("approval request {id}")))?;
        request.status = status;
        Ok(())
    }

    async fn resolve_timed_out(&self, id: Uuid) -> Result<(), EngineError> {
        self.set_status(id, ApprovalStatus::TimedOut).await?;
        self.fire_waiters(id, ApprovalResolution::TimedOut);
        Ok(())
    }

    async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut requests = self.requests.write();
        let doomed: Vec<Uuid> = requests
            .values()
            .filter(|r| r.status != ApprovalStatus::Pending && r.created_at < cutoff)
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            requests.remove(id);
            self.responses.write().remove(id);
            self.waiters.lock().remove(id);
        }
        Ok(doomed.len())
    }
}

/// Applies deadline actions and fans notifications out
pub struct ApprovalManager {
    store: Arc<dyn ApprovalStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ApprovalManager {
    /// Create a manager
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            notifier,
            clock,
            poll_interval: Duration::from_millis(250),
            shutdown_tx,
            shutdown_rx,
            poll_handle: Mutex::new(None),
        }
    }

    /// Set the deadline poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    /// Create a request and notify its assignee
    pub async fn open(&self, request: ApprovalRequest) -> Result<Uuid, EngineError> {
        let id = self.store.create(request.clone()).await?;
        info!(request_id = %id, assignee = ?request.assignee, "approval request opened");
        self.notifier.notify(&request).await;
        Ok(id)
    }

    /// Submit a response, notifying on delegation
    pub async fn respond(&self, response: ApprovalResponse) -> Result<SubmitOutcome, EngineError> {
        let from = response.responded_by.clone();
        let outcome = self.store.submit_response(response).await?;
        if let SubmitOutcome::Delegated { new_request_id } = &outcome {
            if let Some(derived) = self.store.get(*new_request_id).await? {
                let to = derived.assignee.clone().unwrap_or_default();
                self.notifier.notify_delegation(&derived, &from, &to).await;
            }
        }
        Ok(outcome)
    }

    /// Apply deadline actions to all expired requests once
    ///
    /// Returns how many requests were acted on.
    pub async fn poll_deadlines(&self) -> Result<usize, EngineError> {
        apply_deadline_actions(&self.store, &self.notifier, self.clock.now()).await
    }

    /// Start the deadline polling loop
    pub fn start(&self) {
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let clock = Arc::clone(&self.clock);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) =
                            apply_deadline_actions(&store, &notifier, clock.now()).await
                        {
                            error!("approval deadline poll failed: {e}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("approval manager: shutdown requested");
                        break;
                    }
                }
            }
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Stop the deadline polling loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.poll_handle.lock().take() {
            let _ = handle.await;
        }
    }
}

/// Apply the configured timeout action to every expired request
async fn apply_deadline_actions(
    store: &Arc<dyn ApprovalStore>,
    notifier: &Arc<dyn Notifier>,
    now: DateTime<Utc>,
) -> Result<usize, EngineError> {
    let expired = store.expired(now).await?;
    let mut acted = 0;

    for request in expired {
        match request.timeout_action {
            TimeoutAction::Approve | TimeoutAction::Reject => {
                let decision = if request.timeout_action == TimeoutAction::Approve {
                    Decision::Approve
                } else {
                    Decision::Reject
                };
                let response = ApprovalResponse::new(request.id, decision, "system");
                if let Err(e) = store.submit_response(response).await {
                    warn!(request_id = %request.id, "deadline response lost race: {e}");
                    continue;
                }
                notifier.notify_timeout(&request).await;
            }
            TimeoutAction::Escalate => {
                let Some(target) = request.escalate_to.clone() else {
                    warn!(request_id = %request.id, "escalate action without escalate_to; failing");
                    store.resolve_timed_out(request.id).await?;
                    acted += 1;
                    continue;
                };
                let mut escalated = request.clone();
                escalated.id = Uuid::now_v7();
                escalated.assignee = Some(target);
                escalated.status = ApprovalStatus::Pending;
                escalated.created_at = now;
                // The escalated request gets a fresh deadline window.
                escalated.deadline = request.deadline.map(|d| {
                    let window = d - request.created_at;
                    now + window
                });
                escalated
                    .metadata
                    .insert("escalated_from".to_string(), request.id.to_string());

                store.set_status(request.id, ApprovalStatus::Escalated).await?;
                store.create(escalated.clone()).await?;
                notifier
                    .notify_escalation(&escalated, "deadline passed without response")
                    .await;
            }
            TimeoutAction::Fail => {
                store.resolve_timed_out(request.id).await?;
                notifier.notify_timeout(&request).await;
            }
        }
        debug!(request_id = %request.id, action = ?request.timeout_action, "deadline action applied");
        acted += 1;
    }
    Ok(acted)
}

/// One step of a chain approval
#[derive(Debug, Clone)]
pub struct ChainStep {
    /// Step assignee
    pub assignee: String,

    /// Response deadline relative to step start
    pub deadline: Option<Duration>,

    /// What happens when the step's deadline passes
    pub timeout_action: TimeoutAction,
}

impl ChainStep {
    /// Create a step for the given assignee
    pub fn new(assignee: impl Into<String>) -> Self {
        Self {
            assignee: assignee.into(),
            deadline: None,
            timeout_action: TimeoutAction::Reject,
        }
    }

    /// Set the step deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Outcome of a chain approval
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// Every step approved
    Approved,

    /// A step rejected or timed out
    Rejected {
        /// Zero-based index of the terminating step
        step: usize,
        /// Who rejected (`system` for a timeout)
        by: String,
    },
}

/// Run a sequential chain of approvals
///
/// Each step opens a request for its assignee and waits; any reject (or
/// fail-style timeout) terminates the chain with a reject outcome, and
/// unanimity is required for approval.
pub async fn run_chain(
    manager: &ApprovalManager,
    template: &ApprovalRequest,
    steps: &[ChainStep],
) -> Result<ChainOutcome, EngineError> {
    for (index, step) in steps.iter().enumerate() {
        let now = manager.clock.now();
        let mut request = template.clone();
        request.id = Uuid::now_v7();
        request.assignee = Some(step.assignee.clone());
        request.status = ApprovalStatus::Pending;
        request.created_at = now;
        request.timeout_action = step.timeout_action;
        request.deadline = step.deadline.map(|d| {
            now + chrono::TimeDelta::from_std(d).unwrap_or(chrono::TimeDelta::zero())
        });
        request
            .metadata
            .insert("chain_step".to_string(), index.to_string());

        let waiter = manager.store.register_waiter(request.id);
        manager.open(request).await?;

        match waiter.await {
            Ok(ApprovalResolution::Responded(response)) => {
                if response.decision.is_reject() {
                    return Ok(ChainOutcome::Rejected {
                        step: index,
                        by: response.responded_by,
                    });
                }
            }
            Ok(ApprovalResolution::TimedOut) | Err(_) => {
                return Ok(ChainOutcome::Rejected {
                    step: index,
                    by: "system".to_string(),
                });
            }
        }
    }
    Ok(ChainOutcome::Approved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn request() -> ApprovalRequest {
        ApprovalRequest::new(Uuid::now_v7(), Uuid::now_v7(), "review", "Release sign-off")
            .with_assignee("alice")
    }

    fn manager_with(
        store: Arc<InMemoryApprovalStore>,
        notifier: Arc<CollectingNotifier>,
        clock: Arc<ManualClock>,
    ) -> ApprovalManager {
        ApprovalManager::new(store, notifier, clock)
    }

    #[tokio::test]
    async fn test_create_and_pending_for() {
        let store = InMemoryApprovalStore::new();
        let id = store.create(request()).await.unwrap();

        let pending = store.pending_for("alice").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert!(store.pending_for("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_response_wins() {
        let store = InMemoryApprovalStore::new();
        let id = store.create(request()).await.unwrap();

        store
            .submit_response(ApprovalResponse::new(id, Decision::Approve, "alice"))
            .await
            .unwrap();

        let duplicate = store
            .submit_response(ApprovalResponse::new(id, Decision::Reject, "bob"))
            .await;
        assert!(matches!(duplicate, Err(EngineError::Conflict(_))));

        let recorded = store.response(id).await.unwrap().unwrap();
        assert_eq!(recorded.responded_by, "alice");
        assert!(recorded.decision.is_approve());
    }

    #[tokio::test]
    async fn test_waiter_resolves_on_response() {
        let store = InMemoryApprovalStore::new();
        let id = store.create(request()).await.unwrap();

        let waiter = store.register_waiter(id);
        store
            .submit_response(ApprovalResponse::new(id, Decision::Reject, "alice"))
            .await
            .unwrap();

        match waiter.await.unwrap() {
            ApprovalResolution::Responded(response) => {
                assert!(response.decision.is_reject())
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waiter_registered_after_response_resolves_immediately() {
        let store = InMemoryApprovalStore::new();
        let id = store.create(request()).await.unwrap();
        store
            .submit_response(ApprovalResponse::new(id, Decision::Approve, "alice"))
            .await
            .unwrap();

        let waiter = store.register_waiter(id);
        assert!(matches!(
            waiter.await.unwrap(),
            ApprovalResolution::Responded(_)
        ));
    }

    #[tokio::test]
    async fn test_delegation_creates_derived_request() {
        let store = InMemoryApprovalStore::new();
        let id = store.create(request()).await.unwrap();
        let waiter = store.register_waiter(id);

        let outcome = store
            .submit_response(ApprovalResponse::delegate(id, "alice", "carol"))
            .await
            .unwrap();
        let SubmitOutcome::Delegated { new_request_id } = outcome else {
            panic!("expected delegation");
        };

        // Original stays pending; derived links back.
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            ApprovalStatus::Pending
        );
        let derived = store.get(new_request_id).await.unwrap().unwrap();
        assert_eq!(derived.assignee.as_deref(), Some("carol"));
        assert_eq!(
            derived.metadata.get("delegated_from"),
            Some(&id.to_string())
        );

        // A terminal response on the derived request resolves the original
        // waiter too.
        store
            .submit_response(ApprovalResponse::new(
                new_request_id,
                Decision::Approve,
                "carol",
            ))
            .await
            .unwrap();

        match waiter.await.unwrap() {
            ApprovalResolution::Responded(response) => {
                assert_eq!(response.responded_by, "carol");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_escalation() {
        let store = Arc::new(InMemoryApprovalStore::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let clock = Arc::new(ManualClock::new());
        let manager = manager_with(store.clone(), notifier.clone(), clock.clone());

        let mut req = request()
            .with_timeout_action(TimeoutAction::Escalate)
            .with_escalate_to("boss");
        req.deadline = Some(clock.now() + chrono::TimeDelta::milliseconds(200));
        let original_id = manager.open(req).await.unwrap();

        clock.advance(Duration::from_millis(200));
        let acted = manager.poll_deadlines().await.unwrap();
        assert_eq!(acted, 1);

        // Original marked escalated, new pending request aimed at boss.
        assert_eq!(
            store.get(original_id).await.unwrap().unwrap().status,
            ApprovalStatus::Escalated
        );
        let boss_pending = store.pending_for("boss").await.unwrap();
        assert_eq!(boss_pending.len(), 1);
        assert_eq!(
            boss_pending[0].metadata.get("escalated_from"),
            Some(&original_id.to_string())
        );
        assert_eq!(notifier.escalations(), 1);
    }

    #[tokio::test]
    async fn test_deadline_approve_synthesizes_system_response() {
        let store = Arc::new(InMemoryApprovalStore::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let clock = Arc::new(ManualClock::new());
        let manager = manager_with(store.clone(), notifier.clone(), clock.clone());

        let mut req = request().with_timeout_action(TimeoutAction::Approve);
        req.deadline = Some(clock.now() + chrono::TimeDelta::seconds(1));
        let id = manager.open(req).await.unwrap();

        clock.advance(Duration::from_secs(1));
        manager.poll_deadlines().await.unwrap();

        let response = store.response(id).await.unwrap().unwrap();
        assert_eq!(response.responded_by, "system");
        assert!(response.decision.is_approve());
    }

    #[tokio::test]
    async fn test_deadline_fail_times_out_waiters() {
        let store = Arc::new(InMemoryApprovalStore::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let clock = Arc::new(ManualClock::new());
        let manager = manager_with(store.clone(), notifier.clone(), clock.clone());

        let mut req = request().with_timeout_action(TimeoutAction::Fail);
        req.deadline = Some(clock.now() + chrono::TimeDelta::seconds(1));
        let id = manager.open(req).await.unwrap();
        let waiter = store.register_waiter(id);

        clock.advance(Duration::from_secs(1));
        manager.poll_deadlines().await.unwrap();

        assert_eq!(waiter.await.unwrap(), ApprovalResolution::TimedOut);
        // A late response is rejected.
        let late = store
            .submit_response(ApprovalResponse::new(id, Decision::Approve, "alice"))
            .await;
        assert!(matches!(late, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_chain_unanimous_approval() {
        let store = Arc::new(InMemoryApprovalStore::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let clock = Arc::new(ManualClock::new());
        let manager = Arc::new(manager_with(store.clone(), notifier, clock));

        let template = request();
        let steps = vec![ChainStep::new("alice"), ChainStep::new("bob")];

        let store_for_responses = store.clone();
        let responder = tokio::spawn(async move {
            for assignee in ["alice", "bob"] {
                loop {
                    let pending = store_for_responses.pending_for(assignee).await.unwrap();
                    if let Some(req) = pending.first() {
                        store_for_responses
                            .submit_response(ApprovalResponse::new(
                                req.id,
                                Decision::Approve,
                                assignee,
                            ))
                            .await
                            .unwrap();
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        });

        let outcome = run_chain(&manager, &template, &steps).await.unwrap();
        responder.await.unwrap();
        assert_eq!(outcome, ChainOutcome::Approved);
    }

    #[tokio::test]
    async fn test_chain_reject_terminates() {
        let store = Arc::new(InMemoryApprovalStore::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let clock = Arc::new(ManualClock::new());
        let manager = Arc::new(manager_with(store.clone(), notifier, clock));

        let template = request();
        let steps = vec![ChainStep::new("alice"), ChainStep::new("bob")];

        let store_for_responses = store.clone();
        let responder = tokio::spawn(async move {
            loop {
                let pending = store_for_responses.pending_for("alice").await.unwrap();
                if let Some(req) = pending.first() {
                    store_for_responses
                        .submit_response(ApprovalResponse::new(req.id, Decision::Reject, "alice"))
                        .await
                        .unwrap();
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let outcome = run_chain(&manager, &template, &steps).await.unwrap();
        responder.await.unwrap();
        assert_eq!(
            outcome,
            ChainOutcome::Rejected {
                step: 0,
                by: "alice".to_string()
            }
        );
        // Bob was never asked.
        assert!(store.pending_for("bob").await.unwrap().is_empty());
    }
}
