//! Node definitions
//!
//! A node is one unit of work. Its behavior is a tagged sum over the
//! supported node kinds (function, agent, tool, subworkflow, map/reduce,
//! human approval, timer, custom); the executor dispatches on the tag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use windlass_observability::TraceContext;

use super::state::{RunState, StatePatch};
use crate::cancel::CancelToken;
use crate::error::NodeError;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};

/// Context handed to a node for one execution attempt
#[derive(Clone)]
pub struct NodeContext {
    /// Run this dispatch belongs to
    pub run_id: Uuid,

    /// Workflow identity
    pub workflow_id: Uuid,

    /// Workflow name
    pub workflow_name: String,

    /// Name of the executing node
    pub node_name: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Subworkflow nesting depth (0 for a top-level run)
    pub depth: u32,

    /// Immutable snapshot of the run state
    pub state: RunState,

    /// Trace context of the enclosing run span
    pub trace: Option<TraceContext>,

    /// Run-level cancellation token
    pub cancel: CancelToken,
}

impl NodeContext {
    /// Create a context for a node of the given run
    pub fn new(
        run_id: Uuid,
        workflow_id: Uuid,
        workflow_name: impl Into<String>,
        node_name: impl Into<String>,
        state: RunState,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            workflow_name: workflow_name.into(),
            node_name: node_name.into(),
            attempt: 1,
            depth: 0,
            state,
            trace: None,
            cancel: CancelToken::new(),
        }
    }

    /// Context with an updated attempt number
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("run_id", &self.run_id)
            .field("node_name", &self.node_name)
            .field("attempt", &self.attempt)
            .field("depth", &self.depth)
            .finish()
    }
}

/// What a node produced
///
/// The `update` patch is merged into the run state; `value` is recorded
/// as the node's output; `next`, when set, overrides the scheduler's
/// successor computation for this node (an explicit empty list means "no
/// successors from this branch").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// State fields to merge (last writer wins per field)
    #[serde(default)]
    pub update: StatePatch,

    /// Recorded output value
    #[serde(default)]
    pub value: serde_json::Value,

    /// Explicit successor override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Vec<String>>,
}

impl NodeOutput {
    /// An output with no state change
    pub fn empty() -> Self {
        Self::default()
    }

    /// An output that merges the given patch
    pub fn update(update: StatePatch) -> Self {
        Self {
            value: serde_json::Value::Object(update.clone()),
            update,
            next: None,
        }
    }

    /// An output carrying only a recorded value
    pub fn value(value: serde_json::Value) -> Self {
        Self {
            update: StatePatch::new(),
            value,
            next: None,
        }
    }

    /// Set a single state field
    pub fn set(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.update.insert(key.into(), value);
        self
    }

    /// Override the recorded value
    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = value;
        self
    }

    /// Route explicitly to the given successors
    pub fn with_next<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next = Some(next.into_iter().map(Into::into).collect());
        self
    }

    /// Explicitly end this branch (no successors)
    pub fn terminate(mut self) -> Self {
        self.next = Some(vec![]);
        self
    }
}

/// Future returned by a node function
pub type NodeFuture = BoxFuture<'static, Result<NodeOutput, NodeError>>;

/// A plain async node function
pub type NodeFn = Arc<dyn Fn(NodeContext) -> NodeFuture + Send + Sync>;

/// Future returned by a compensation function
pub type CompensationFuture = BoxFuture<'static, Result<(), NodeError>>;

/// A compensating action registered on node success and invoked, in
/// reverse registration order, when the run fails
pub type CompensationFn = Arc<dyn Fn(NodeContext) -> CompensationFuture + Send + Sync>;

/// Escape hatch for node behaviors not covered by the built-in kinds
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Handler kind tag (for spans and logs)
    fn kind(&self) -> &'static str {
        "custom"
    }

    /// Execute the node
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Narrow seam to an LLM/agent backend
///
/// The engine never talks to a model directly; an agent node delegates to
/// whatever driver the embedding application plugs in here.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Run one agent completion over the node's input
    async fn complete(
        &self,
        ctx: &NodeContext,
        config: &AgentConfig,
    ) -> Result<AgentReply, NodeError>;
}

/// Configuration for an agent node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Model identifier, interpreted by the driver
    pub model: String,

    /// System instructions
    #[serde(default)]
    pub instructions: String,

    /// State field read as the agent input (default `input`)
    #[serde(default = "default_input_key")]
    pub input_key: String,

    /// State field written with the agent output (default `output`)
    #[serde(default = "default_output_key")]
    pub output_key: String,
}

fn default_input_key() -> String {
    "input".to_string()
}

fn default_output_key() -> String {
    "output".to_string()
}

/// What an agent driver produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    /// Output value, written to the configured state field
    pub output: serde_json::Value,

    /// Tokens consumed by the call
    #[serde(default)]
    pub tokens: u64,

    /// Cost in micro-units
    #[serde(default)]
    pub cost_micros: u64,
}

/// Narrow seam to a tool implementation
#[async_trait]
pub trait ToolDriver: Send + Sync {
    /// Tool name (for spans and logs)
    fn name(&self) -> &str;

    /// Invoke the tool with JSON arguments
    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, NodeError>;
}

/// Configuration for a tool node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// State field read as the tool arguments; the whole state when unset
    #[serde(default)]
    pub args_key: Option<String>,

    /// State field written with the tool result (default `output`)
    #[serde(default = "default_output_key")]
    pub output_key: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            args_key: None,
            output_key: default_output_key(),
        }
    }
}

/// The behavior of a node
///
/// Each variant carries its own configuration record; the executor
/// dispatches on the tag.
#[derive(Clone)]
pub enum NodeKind {
    /// A plain async function over the state
    Function(NodeFn),

    /// An LLM/agent call behind [`AgentDriver`]
    Agent {
        /// Driver implementation
        driver: Arc<dyn AgentDriver>,
        /// Node configuration
        config: AgentConfig,
    },

    /// A tool invocation behind [`ToolDriver`]
    Tool {
        /// Tool implementation
        tool: Arc<dyn ToolDriver>,
        /// Node configuration
        config: ToolConfig,
    },

    /// A nested workflow run
    Subworkflow(crate::patterns::SubworkflowConfig),

    /// Bounded fan-out over items derived from state
    Map(crate::patterns::MapConfig),

    /// Fold of previously mapped items
    Reduce(crate::patterns::ReduceConfig),

    /// Map followed by reduce in one node
    MapReduce(crate::patterns::MapReduceConfig),

    /// Human approval: suspend until a decision arrives
    Human(crate::approval::ApprovalNodeConfig),

    /// Durable wait: suspend until a timer fires
    Timer(crate::timer::TimerNodeConfig),

    /// Escape variant for custom handlers
    Custom(Arc<dyn NodeHandler>),
}

impl NodeKind {
    /// Tag name (for spans and logs)
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Agent { .. } => "agent",
            Self::Tool { .. } => "tool",
            Self::Subworkflow(_) => "subworkflow",
            Self::Map(_) => "map",
            Self::Reduce(_) => "reduce",
            Self::MapReduce(_) => "map_reduce",
            Self::Human(_) => "human",
            Self::Timer(_) => "timer",
            Self::Custom(_) => "custom",
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeKind::{}", self.tag())
    }
}

/// One unit of work in a workflow
#[derive(Clone)]
pub struct NodeDef {
    /// Unique node name within the workflow
    pub name: String,

    /// Node behavior
    pub kind: NodeKind,

    /// Per-node retry policy (envelope default applies when unset)
    pub retry: Option<RetryPolicy>,

    /// Per-attempt deadline
    pub timeout: Option<Duration>,

    /// Per-node circuit breaker
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Compensating action registered when the node succeeds
    pub compensation: Option<CompensationFn>,

    /// Retry policy for the compensating action
    pub compensation_retry: Option<RetryPolicy>,

    /// Saga scope for compensation ordering
    pub compensation_scope: Option<String>,

    /// Whether dispatches are deduplicated through the idempotency store
    pub idempotent: bool,
}

impl NodeDef {
    /// Create a node with the given behavior
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            retry: None,
            timeout: None,
            circuit_breaker: None,
            compensation: None,
            compensation_retry: None,
            compensation_scope: None,
            idempotent: false,
        }
    }

    /// Create a function node from an async closure
    ///
    /// # Example
    ///
    /// ```
    /// use windlass_core::model::{NodeDef, NodeOutput};
    /// use serde_json::json;
    ///
    /// let node = NodeDef::function("greet", |_ctx| async move {
    ///     Ok(NodeOutput::empty().set("greeting", json!("hello")))
    /// });
    /// assert_eq!(node.name, "greet");
    /// ```
    pub fn function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<NodeOutput, NodeError>> + Send + 'static,
    {
        let f: NodeFn = Arc::new(move |ctx| Box::pin(f(ctx)));
        Self::new(name, NodeKind::Function(f))
    }

    /// Create an agent node
    pub fn agent(name: impl Into<String>, driver: Arc<dyn AgentDriver>, config: AgentConfig) -> Self {
        Self::new(name, NodeKind::Agent { driver, config })
    }

    /// Create a tool node
    pub fn tool(name: impl Into<String>, tool: Arc<dyn ToolDriver>, config: ToolConfig) -> Self {
        Self::new(name, NodeKind::Tool { tool, config })
    }

    /// Create a custom-handler node
    pub fn custom(name: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        Self::new(name, NodeKind::Custom(handler))
    }

    /// Set the retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a circuit breaker
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Register a compensating action
    pub fn with_compensation<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        self.compensation = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Set the retry policy for the compensating action
    pub fn with_compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = Some(policy);
        self
    }

    /// Put the compensating action in a saga scope
    pub fn with_compensation_scope(mut self, scope: impl Into<String>) -> Self {
        self.compensation_scope = Some(scope.into());
        self
    }

    /// Mark the node idempotent (deduplicated through the idempotency store)
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

impl std::fmt::Debug for NodeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDef")
            .field("name", &self.name)
            .field("kind", &self.kind.tag())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}
