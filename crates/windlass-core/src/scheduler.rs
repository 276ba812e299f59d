//! Scheduler: dependency resolution and bounded parallel dispatch
//!
//! The scheduler derives a predecessor map from the workflow's edges,
//! computes which nodes are ready against the completed set and the
//! current state, and resolves successors after each completion. Edge
//! evaluation is deterministic: edges are scanned in insertion order and
//! the first matching conditional branch wins.

use std::collections::{BTreeSet, HashMap, HashSet};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

use crate::model::{Edge, RunState, Workflow};

/// Successor resolution for one completed node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Successors {
    /// Nodes that become eligible
    pub nodes: Vec<String>,

    /// Completed nodes that must re-run (loop re-entry)
    pub reopened: Vec<String>,
}

/// Predecessor map: node -> set of nodes that can route into it
///
/// Built from the forward direction of every edge; the implicit loop
/// return (body back to its head) is handled by successor resolution,
/// not the predecessor map, so a loop head is not blocked on its own
/// body at first entry.
pub fn predecessors(workflow: &Workflow) -> HashMap<String, HashSet<String>> {
    let mut map: HashMap<String, HashSet<String>> = HashMap::new();
    for name in workflow.node_names() {
        map.entry(name.to_string()).or_default();
    }
    for edge in workflow.edges() {
        let from = edge.from_node().to_string();
        for target in edge.possible_targets() {
            map.entry(target.to_string())
                .or_default()
                .insert(from.clone());
        }
    }
    map
}

/// Nodes ready to execute
///
/// A node is ready when all of its predecessors are completed, it is not
/// itself completed, and at least one incoming edge currently routes to
/// it under the given state. The entry point is ready while nothing has
/// completed.
pub fn ready_nodes(
    workflow: &Workflow,
    completed: &BTreeSet<String>,
    state: &RunState,
    loop_iterations: &HashMap<String, u32>,
) -> Vec<String> {
    let preds = predecessors(workflow);
    let mut ready = Vec::new();

    for name in workflow.node_names() {
        if completed.contains(name) {
            continue;
        }
        let node_preds = &preds[name];
        if node_preds.is_empty() {
            if name == workflow.entry_point && completed.is_empty() {
                ready.push(name.to_string());
            }
            continue;
        }
        if !node_preds.iter().all(|p| completed.contains(p)) {
            continue;
        }
        // All predecessors completed: require an incoming edge that
        // actually routes here under the current state.
        let routed = workflow.edges().iter().any(|edge| {
            completed.contains(edge.from_node())
                && resolve_edge(edge, state, loop_iterations)
                    .iter()
                    .any(|t| t == name)
        });
        if routed {
            ready.push(name.to_string());
        }
    }
    ready
}

/// Resolve one edge against the current state (read-only)
fn resolve_edge(
    edge: &Edge,
    state: &RunState,
    loop_iterations: &HashMap<String, u32>,
) -> Vec<String> {
    match edge {
        Edge::Sequential { to, .. } => vec![to.clone()],
        Edge::Parallel { to, .. } => to.clone(),
        Edge::Conditional {
            branches, default, ..
        } => branches
            .iter()
            .find(|b| (b.when)(state))
            .map(|b| vec![b.to.clone()])
            .unwrap_or_else(|| default.iter().cloned().collect()),
        Edge::Loop {
            from,
            body,
            condition,
            max_iterations,
            exit,
        } => {
            let iterations = loop_iterations.get(from).copied().unwrap_or(0);
            if (condition)(state) && iterations < *max_iterations {
                vec![body.clone()]
            } else {
                exit.iter().cloned().collect()
            }
        }
    }
}

/// Nodes that become eligible after `node` completes
///
/// Conditional and loop edges are resolved against the current state;
/// routing a loop edge into its body consumes one iteration and reopens
/// the body, and a body completion implicitly returns to its loop head.
pub fn successors(
    workflow: &Workflow,
    node: &str,
    state: &RunState,
    loop_iterations: &mut HashMap<String, u32>,
) -> Successors {
    let mut result = Successors::default();

    for edge in workflow.edges() {
        if edge.from_node() == node {
            match edge {
                Edge::Loop {
                    from,
                    body,
                    condition,
                    max_iterations,
                    exit,
                } => {
                    let iterations = loop_iterations.get(from).copied().unwrap_or(0);
                    if (condition)(state) && iterations < *max_iterations {
                        *loop_iterations.entry(from.clone()).or_insert(0) += 1;
                        result.nodes.push(body.clone());
                        result.reopened.push(body.clone());
                    } else if let Some(exit) = exit {
                        result.nodes.push(exit.clone());
                    }
                }
                other => result.nodes.extend(resolve_edge(other, state, loop_iterations)),
            }
        }

        // Loop return: completing the body hands control back to the head.
        if let Edge::Loop { from, body, .. } = edge {
            if body == node && from != node {
                result.nodes.push(from.clone());
                result.reopened.push(from.clone());
            }
        }
    }

    dedup_preserving_order(&mut result.nodes);
    dedup_preserving_order(&mut result.reopened);
    result
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// Run boxed tasks with bounded parallelism
///
/// Drives up to `max_concurrency` tasks at a time and resolves when all
/// have finished, returning results in input order. A failing task does
/// not cancel its siblings; cancellation is the caller's decision.
pub async fn dispatch_bounded<'a, T: Send>(
    tasks: Vec<BoxFuture<'a, T>>,
    max_concurrency: usize,
) -> Vec<T> {
    let bound = max_concurrency.max(1);
    let mut remaining: Vec<(usize, BoxFuture<'a, T>)> = tasks.into_iter().enumerate().collect();
    remaining.reverse();
    let mut in_flight = stream::FuturesUnordered::new();
    let mut indexed: Vec<(usize, T)> = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() || !in_flight.is_empty() {
        while in_flight.len() < bound {
            let Some((index, task)) = remaining.pop() else {
                break;
            };
            in_flight.push(async move { (index, task.await) });
        }
        if let Some(result) = in_flight.next().await {
            indexed.push(result);
        }
    }
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, value)| value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeDef, NodeOutput};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn noop(name: &str) -> NodeDef {
        NodeDef::function(name, |_| async { Ok(NodeOutput::empty()) })
    }

    fn diamond() -> Arc<Workflow> {
        Workflow::builder("diamond")
            .add_node(noop("a"))
            .add_node(noop("b"))
            .add_node(noop("c"))
            .add_node(noop("d"))
            .add_edge(Edge::parallel("a", ["b", "c"]))
            .add_edge(Edge::sequential("b", "d"))
            .add_edge(Edge::sequential("c", "d"))
            .entry_point("a")
            .build()
            .unwrap()
    }

    #[test]
    fn test_predecessor_map() {
        let workflow = diamond();
        let preds = predecessors(&workflow);

        assert!(preds["a"].is_empty());
        assert_eq!(preds["b"], HashSet::from(["a".to_string()]));
        assert_eq!(
            preds["d"],
            HashSet::from(["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_entry_point_ready_initially() {
        let workflow = diamond();
        let ready = ready_nodes(
            &workflow,
            &BTreeSet::new(),
            &RunState::new(),
            &HashMap::new(),
        );
        assert_eq!(ready, vec!["a".to_string()]);
    }

    #[test]
    fn test_join_waits_for_all_predecessors() {
        let workflow = diamond();
        let state = RunState::new();
        let counters = HashMap::new();

        let completed: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let ready = ready_nodes(&workflow, &completed, &state, &counters);
        assert_eq!(ready, vec!["c".to_string()]); // d still blocked on c

        let completed: BTreeSet<String> =
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let ready = ready_nodes(&workflow, &completed, &state, &counters);
        assert_eq!(ready, vec!["d".to_string()]);
    }

    #[test]
    fn test_ready_is_subset_of_predecessor_closure() {
        // Property: ready ⊆ { n | predecessors(n) ⊆ completed }
        let workflow = diamond();
        let preds = predecessors(&workflow);
        let state = RunState::new();
        let counters = HashMap::new();

        let subsets: Vec<BTreeSet<String>> = vec![
            BTreeSet::new(),
            ["a"].iter().map(|s| s.to_string()).collect(),
            ["a", "c"].iter().map(|s| s.to_string()).collect(),
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect(),
            ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect(),
        ];
        for completed in subsets {
            for node in ready_nodes(&workflow, &completed, &state, &counters) {
                assert!(
                    preds[&node].iter().all(|p| completed.contains(p)),
                    "node {node} ready with incomplete predecessors"
                );
            }
        }
    }

    #[test]
    fn test_successors_sequential_and_parallel() {
        let workflow = diamond();
        let mut counters = HashMap::new();

        let next = successors(&workflow, "a", &RunState::new(), &mut counters);
        assert_eq!(next.nodes, vec!["b".to_string(), "c".to_string()]);
        assert!(next.reopened.is_empty());

        let next = successors(&workflow, "b", &RunState::new(), &mut counters);
        assert_eq!(next.nodes, vec!["d".to_string()]);
    }

    #[test]
    fn test_conditional_first_match_wins() {
        let workflow = Workflow::builder("cond")
            .add_node(noop("check"))
            .add_node(noop("low"))
            .add_node(noop("high"))
            .add_node(noop("other"))
            .add_edge(Edge::conditional(
                "check",
                vec![
                    Edge::branch(|s| s.get_i64("x").unwrap_or(0) < 10, "low"),
                    Edge::branch(|s| s.get_i64("x").unwrap_or(0) < 100, "high"),
                ],
                Some("other".to_string()),
            ))
            .entry_point("check")
            .build()
            .unwrap();

        let mut counters = HashMap::new();
        let mut state = RunState::new();

        state.set("x", json!(5)); // both branches match; first wins
        let next = successors(&workflow, "check", &state, &mut counters);
        assert_eq!(next.nodes, vec!["low".to_string()]);

        state.set("x", json!(50));
        let next = successors(&workflow, "check", &state, &mut counters);
        assert_eq!(next.nodes, vec!["high".to_string()]);

        state.set("x", json!(500));
        let next = successors(&workflow, "check", &state, &mut counters);
        assert_eq!(next.nodes, vec!["other".to_string()]);
    }

    fn loop_workflow(max_iterations: u32) -> Arc<Workflow> {
        Workflow::builder("loop")
            .add_node(noop("head"))
            .add_node(noop("body"))
            .add_node(noop("done"))
            .add_edge(Edge::looping(
                "head",
                "body",
                |s: &RunState| s.get_i64("i").unwrap_or(0) < 3,
                max_iterations,
                Some("done".to_string()),
            ))
            .entry_point("head")
            .build()
            .unwrap()
    }

    #[test]
    fn test_loop_routes_to_body_then_exit() {
        let workflow = loop_workflow(10);
        let mut counters = HashMap::new();
        let mut state = RunState::new();
        state.set("i", json!(0));

        let next = successors(&workflow, "head", &state, &mut counters);
        assert_eq!(next.nodes, vec!["body".to_string()]);
        assert_eq!(next.reopened, vec!["body".to_string()]);
        assert_eq!(counters["head"], 1);

        // Body returns to head, reopening it
        let next = successors(&workflow, "body", &state, &mut counters);
        assert_eq!(next.nodes, vec!["head".to_string()]);
        assert_eq!(next.reopened, vec!["head".to_string()]);

        // Predicate now false: loop exits
        state.set("i", json!(3));
        let next = successors(&workflow, "head", &state, &mut counters);
        assert_eq!(next.nodes, vec!["done".to_string()]);
        assert!(next.reopened.is_empty());
    }

    #[test]
    fn test_loop_iteration_cap() {
        let workflow = loop_workflow(2);
        let mut counters = HashMap::new();
        let mut state = RunState::new();
        state.set("i", json!(0)); // predicate stays true

        for _ in 0..2 {
            let next = successors(&workflow, "head", &state, &mut counters);
            assert_eq!(next.nodes, vec!["body".to_string()]);
        }
        // Cap reached: exit despite the predicate holding
        let next = successors(&workflow, "head", &state, &mut counters);
        assert_eq!(next.nodes, vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_bounded_preserves_order() {
        let tasks: Vec<BoxFuture<'static, usize>> = (0..8)
            .map(|i| {
                let fut: BoxFuture<'static, usize> = Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis((8 - i) as u64)).await;
                    i
                });
                fut
            })
            .collect();

        let results = dispatch_bounded(tasks, 3).await;
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dispatch_bounded_respects_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<BoxFuture<'static, ()>> = (0..10)
            .map(|_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let fut: BoxFuture<'static, ()> = Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
                fut
            })
            .collect();

        dispatch_bounded(tasks, 2).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_dispatch_bounded_sibling_failure_does_not_cancel() {
        let tasks: Vec<BoxFuture<'static, Result<u32, String>>> = vec![
            Box::pin(async { Err("boom".to_string()) }),
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(7)
            }),
        ];

        let results = dispatch_bounded(tasks, 2).await;
        assert_eq!(results[0], Err("boom".to_string()));
        assert_eq!(results[1], Ok(7));
    }
}
