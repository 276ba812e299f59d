//! Workflow graph data model
//!
//! Workflow (immutable description), nodes and their kind sum type,
//! edges, the shared run state, and run records.

mod edge;
mod node;
mod run;
mod state;
mod workflow;

pub use edge::{ConditionalBranch, Edge, Predicate};
pub use node::{
    AgentConfig, AgentDriver, AgentReply, CompensationFn, CompensationFuture, NodeContext,
    NodeDef, NodeFn, NodeFuture, NodeHandler, NodeKind, NodeOutput, ToolConfig, ToolDriver,
};
pub use run::{NodeOutcome, Run, RunResult, RunStatus, WaitReason};
pub use state::{patch, RunState, StatePatch};
pub use workflow::{Workflow, WorkflowBuilder};
