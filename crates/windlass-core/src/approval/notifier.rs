//! Notifier implementations
//!
//! Notifications are fire-and-forget: a failing notifier is logged and
//! never fails the run that triggered it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use super::{ApprovalPriority, ApprovalRequest};

/// Delivers approval notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A request was created
    async fn notify(&self, request: &ApprovalRequest);

    /// A request was escalated
    async fn notify_escalation(&self, request: &ApprovalRequest, reason: &str);

    /// A request's deadline passed
    async fn notify_timeout(&self, request: &ApprovalRequest);

    /// A request was delegated
    async fn notify_delegation(&self, request: &ApprovalRequest, from: &str, to: &str);
}

/// Logs notifications through `tracing`
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl ConsoleNotifier {
    /// Create a console notifier
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, request: &ApprovalRequest) {
        info!(
            request_id = %request.id,
            assignee = ?request.assignee,
            priority = ?request.priority,
            "approval requested: {}",
            request.title
        );
    }

    async fn notify_escalation(&self, request: &ApprovalRequest, reason: &str) {
        info!(
            request_id = %request.id,
            assignee = ?request.assignee,
            "approval escalated ({reason}): {}",
            request.title
        );
    }

    async fn notify_timeout(&self, request: &ApprovalRequest) {
        info!(request_id = %request.id, "approval deadline passed: {}", request.title);
    }

    async fn notify_delegation(&self, request: &ApprovalRequest, from: &str, to: &str) {
        info!(
            request_id = %request.id,
            "approval delegated from {from} to {to}: {}",
            request.title
        );
    }
}

/// Posts notifications as JSON to an HTTP endpoint
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    /// Create a notifier posting to `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn post(&self, event: &str, body: serde_json::Value) {
        let payload = json!({ "event": event, "request": body });
        let result = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    status = response.status().as_u16(),
                    "webhook notifier rejected {event}"
                );
            }
            Err(e) => warn!("webhook notifier failed for {event}: {e}"),
            _ => {}
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, request: &ApprovalRequest) {
        self.post("approval.requested", json!(request)).await;
    }

    async fn notify_escalation(&self, request: &ApprovalRequest, reason: &str) {
        self.post(
            "approval.escalated",
            json!({ "request": request, "reason": reason }),
        )
        .await;
    }

    async fn notify_timeout(&self, request: &ApprovalRequest) {
        self.post("approval.timed_out", json!(request)).await;
    }

    async fn notify_delegation(&self, request: &ApprovalRequest, from: &str, to: &str) {
        self.post(
            "approval.delegated",
            json!({ "request": request, "from": from, "to": to }),
        )
        .await;
    }
}

/// Fans notifications out to several notifiers
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    /// Create a composite over the given notifiers
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, request: &ApprovalRequest) {
        for notifier in &self.notifiers {
            notifier.notify(request).await;
        }
    }

    async fn notify_escalation(&self, request: &ApprovalRequest, reason: &str) {
        for notifier in &self.notifiers {
            notifier.notify_escalation(request, reason).await;
        }
    }

    async fn notify_timeout(&self, request: &ApprovalRequest) {
        for notifier in &self.notifiers {
            notifier.notify_timeout(request).await;
        }
    }

    async fn notify_delegation(&self, request: &ApprovalRequest, from: &str, to: &str) {
        for notifier in &self.notifiers {
            notifier.notify_delegation(request, from, to).await;
        }
    }
}

/// Routes by request priority, with a fallback route
pub struct PriorityRoutedNotifier {
    routes: HashMap<ApprovalPriority, Arc<dyn Notifier>>,
    fallback: Arc<dyn Notifier>,
}

impl PriorityRoutedNotifier {
    /// Create a router with the given fallback
    pub fn new(fallback: Arc<dyn Notifier>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback,
        }
    }

    /// Route one priority to a notifier
    pub fn route(mut self, priority: ApprovalPriority, notifier: Arc<dyn Notifier>) -> Self {
        self.routes.insert(priority, notifier);
        self
    }

    fn notifier_for(&self, priority: ApprovalPriority) -> &Arc<dyn Notifier> {
        self.routes.get(&priority).unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl Notifier for PriorityRoutedNotifier {
    async fn notify(&self, request: &ApprovalRequest) {
        self.notifier_for(request.priority).notify(request).await;
    }

    async fn notify_escalation(&self, request: &ApprovalRequest, reason: &str) {
        self.notifier_for(request.priority)
            .notify_escalation(request, reason)
            .await;
    }

    async fn notify_timeout(&self, request: &ApprovalRequest) {
        self.notifier_for(request.priority)
            .notify_timeout(request)
            .await;
    }

    async fn notify_delegation(&self, request: &ApprovalRequest, from: &str, to: &str) {
        self.notifier_for(request.priority)
            .notify_delegation(request, from, to)
            .await;
    }
}

/// Forwards only requests matching a predicate
pub struct FilteredNotifier {
    predicate: Box<dyn Fn(&ApprovalRequest) -> bool + Send + Sync>,
    inner: Arc<dyn Notifier>,
}

impl FilteredNotifier {
    /// Create a filter in front of `inner`
    pub fn new<F>(predicate: F, inner: Arc<dyn Notifier>) -> Self
    where
        F: Fn(&ApprovalRequest) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            inner,
        }
    }
}

#[async_trait]
impl Notifier for FilteredNotifier {
    async fn notify(&self, request: &ApprovalRequest) {
        if (self.predicate)(request) {
            self.inner.notify(request).await;
        }
    }

    async fn notify_escalation(&self, request: &ApprovalRequest, reason: &str) {
        if (self.predicate)(request) {
            self.inner.notify_escalation(request, reason).await;
        }
    }

    async fn notify_timeout(&self, request: &ApprovalRequest) {
        if (self.predicate)(request) {
            self.inner.notify_timeout(request).await;
        }
    }

    async fn notify_delegation(&self, request: &ApprovalRequest, from: &str, to: &str) {
        if (self.predicate)(request) {
            self.inner.notify_delegation(request, from, to).await;
        }
    }
}

/// Records notification counts (for tests)
#[derive(Default)]
pub struct CollectingNotifier {
    notified: Mutex<Vec<ApprovalRequest>>,
    escalations: Mutex<Vec<(ApprovalRequest, String)>>,
    timeouts: Mutex<Vec<ApprovalRequest>>,
    delegations: Mutex<Vec<(ApprovalRequest, String, String)>>,
}

impl CollectingNotifier {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests notified so far
    pub fn notified(&self) -> Vec<ApprovalRequest> {
        self.notified.lock().clone()
    }

    /// Number of escalation notifications
    pub fn escalations(&self) -> usize {
        self.escalations.lock().len()
    }

    /// Number of timeout notifications
    pub fn timeouts(&self) -> usize {
        self.timeouts.lock().len()
    }

    /// Number of delegation notifications
    pub fn delegations(&self) -> usize {
        self.delegations.lock().len()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, request: &ApprovalRequest) {
        self.notified.lock().push(request.clone());
    }

    async fn notify_escalation(&self, request: &ApprovalRequest, reason: &str) {
        self.escalations
            .lock()
            .push((request.clone(), reason.to_string()));
    }

    async fn notify_timeout(&self, request: &ApprovalRequest) {
        self.timeouts.lock().push(request.clone());
    }

    async fn notify_delegation(&self, request: &ApprovalRequest, from: &str, to: &str) {
        self.delegations
            .lock()
            .push((request.clone(), from.to_string(), to.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(priority: ApprovalPriority) -> ApprovalRequest {
        ApprovalRequest::new(Uuid::now_v7(), Uuid::now_v7(), "review", "Sign-off")
            .with_assignee("alice")
            .with_priority(priority)
    }

    #[tokio::test]
    async fn test_composite_fans_out() {
        let a = Arc::new(CollectingNotifier::new());
        let b = Arc::new(CollectingNotifier::new());
        let composite = CompositeNotifier::new(vec![a.clone(), b.clone()]);

        composite.notify(&request(ApprovalPriority::Normal)).await;
        assert_eq!(a.notified().len(), 1);
        assert_eq!(b.notified().len(), 1);
    }

    #[tokio::test]
    async fn test_priority_routing() {
        let critical = Arc::new(CollectingNotifier::new());
        let fallback = Arc::new(CollectingNotifier::new());
        let router = PriorityRoutedNotifier::new(fallback.clone())
            .route(ApprovalPriority::Critical, critical.clone());

        router.notify(&request(ApprovalPriority::Critical)).await;
        router.notify(&request(ApprovalPriority::Low)).await;

        assert_eq!(critical.notified().len(), 1);
        assert_eq!(fallback.notified().len(), 1);
    }

    #[tokio::test]
    async fn test_filtered_notifier() {
        let inner = Arc::new(CollectingNotifier::new());
        let filtered = FilteredNotifier::new(
            |r| r.priority >= ApprovalPriority::High,
            inner.clone(),
        );

        filtered.notify(&request(ApprovalPriority::Low)).await;
        filtered.notify(&request(ApprovalPriority::High)).await;

        assert_eq!(inner.notified().len(), 1);
        assert_eq!(inner.notified()[0].priority, ApprovalPriority::High);
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/approvals"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hooks/approvals", server.uri()));
        let req = request(ApprovalPriority::Normal);
        notifier.notify(&req).await;
        notifier.notify_delegation(&req, "alice", "bob").await;
    }

    #[tokio::test]
    async fn test_webhook_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri());
        // Must not panic or error.
        notifier.notify(&request(ApprovalPriority::Normal)).await;
    }
}
