//! Edges: routing rules between nodes
//!
//! Four edge shapes: sequential, conditional (first matching branch
//! wins), parallel fan-out, and loop (body while the predicate holds,
//! bounded by an iteration cap).

use std::sync::Arc;

use super::state::RunState;

/// A predicate over the run state
pub type Predicate = Arc<dyn Fn(&RunState) -> bool + Send + Sync>;

/// One branch of a conditional edge
#[derive(Clone)]
pub struct ConditionalBranch {
    /// Branch condition
    pub when: Predicate,

    /// Target node when the condition holds
    pub to: String,
}

/// A routing rule between nodes
#[derive(Clone)]
pub enum Edge {
    /// `from` completes, `to` becomes ready
    Sequential {
        /// Source node
        from: String,
        /// Target node
        to: String,
    },

    /// `from` completes, the first branch whose predicate holds wins
    Conditional {
        /// Source node
        from: String,
        /// Branches, evaluated in order
        branches: Vec<ConditionalBranch>,
        /// Target when no branch matches
        default: Option<String>,
    },

    /// `from` completes, all targets become ready together
    Parallel {
        /// Source node
        from: String,
        /// Fan-out targets
        to: Vec<String>,
    },

    /// `from` completes, route to `body` while the predicate holds and
    /// the iteration counter is under the cap, then to `exit`
    Loop {
        /// Loop head
        from: String,
        /// Loop body
        body: String,
        /// Continue condition, evaluated on the current state
        condition: Predicate,
        /// Maximum loop iterations
        max_iterations: u32,
        /// Target when the loop ends (run ends here when unset)
        exit: Option<String>,
    },
}

impl Edge {
    /// Create a sequential edge
    pub fn sequential(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::Sequential {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a parallel fan-out edge
    pub fn parallel<I, S>(from: impl Into<String>, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Parallel {
            from: from.into(),
            to: to.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a conditional edge
    pub fn conditional(
        from: impl Into<String>,
        branches: Vec<ConditionalBranch>,
        default: Option<String>,
    ) -> Self {
        Self::Conditional {
            from: from.into(),
            branches,
            default,
        }
    }

    /// Create a conditional branch
    pub fn branch<F>(when: F, to: impl Into<String>) -> ConditionalBranch
    where
        F: Fn(&RunState) -> bool + Send + Sync + 'static,
    {
        ConditionalBranch {
            when: Arc::new(when),
            to: to.into(),
        }
    }

    /// Create a loop edge
    pub fn looping<F>(
        from: impl Into<String>,
        body: impl Into<String>,
        condition: F,
        max_iterations: u32,
        exit: Option<String>,
    ) -> Self
    where
        F: Fn(&RunState) -> bool + Send + Sync + 'static,
    {
        Self::Loop {
            from: from.into(),
            body: body.into(),
            condition: Arc::new(condition),
            max_iterations,
            exit,
        }
    }

    /// The source node of this edge
    pub fn from_node(&self) -> &str {
        match self {
            Self::Sequential { from, .. }
            | Self::Conditional { from, .. }
            | Self::Parallel { from, .. }
            | Self::Loop { from, .. } => from,
        }
    }

    /// Every node this edge can route to
    pub fn possible_targets(&self) -> Vec<&str> {
        match self {
            Self::Sequential { to, .. } => vec![to.as_str()],
            Self::Conditional {
                branches, default, ..
            } => branches
                .iter()
                .map(|b| b.to.as_str())
                .chain(default.as_deref())
                .collect(),
            Self::Parallel { to, .. } => to.iter().map(String::as_str).collect(),
            Self::Loop { body, exit, .. } => std::iter::once(body.as_str())
                .chain(exit.as_deref())
                .collect(),
        }
    }

    /// Whether this is a loop edge
    pub fn is_loop(&self) -> bool {
        matches!(self, Self::Loop { .. })
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential { from, to } => write!(f, "Edge::Sequential({from} -> {to})"),
            Self::Conditional {
                from,
                branches,
                default,
            } => write!(
                f,
                "Edge::Conditional({from} -> {:?} default={default:?})",
                branches.iter().map(|b| b.to.as_str()).collect::<Vec<_>>()
            ),
            Self::Parallel { from, to } => write!(f, "Edge::Parallel({from} -> {to:?})"),
            Self::Loop {
                from,
                body,
                max_iterations,
                exit,
                ..
            } => write!(
                f,
                "Edge::Loop({from} -> {body}, max={max_iterations}, exit={exit:?})"
            ),
        }
    }
}
