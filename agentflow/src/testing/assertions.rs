//! Assertions over run results.

use super::mocks::RecordingAgent;
use crate::core::NodeStatus;
use crate::graph::ExecutionGraph;
use crate::scheduler::{ExecutionResult, RunStatus};

/// Asserts the run finished with `expected`.
pub fn assert_run_status(result: &ExecutionResult, expected: RunStatus) {
    assert_eq!(
        result.status, expected,
        "Expected run status {expected}, got {} (error: {:?})",
        result.status, result.error
    );
}

/// Asserts `node_id` ended in `expected`.
pub fn assert_node_status(result: &ExecutionResult, node_id: &str, expected: NodeStatus) {
    let actual = result.status_of(node_id);
    assert_eq!(
        actual,
        Some(expected),
        "Expected node '{node_id}' to be {expected:?}, got {actual:?} (error: {:?})",
        result.node(node_id).and_then(|n| n.error.clone())
    );
}

/// Asserts every edge's source was scheduled in an earlier level than its
/// target.
pub fn assert_levels_respect_edges(graph: &ExecutionGraph, result: &ExecutionResult) {
    let level_of = |id: &str| {
        result
            .levels
            .iter()
            .position(|level| level.iter().any(|n| n == id))
    };
    for edge in graph.edges() {
        let (Some(source), Some(target)) = (level_of(&edge.source), level_of(&edge.target)) else {
            panic!("Edge {edge} references a node missing from the levels");
        };
        assert!(source < target, "Edge {edge}: source level {source} >= target level {target}");
    }
}

/// Asserts no agent call started before every direct predecessor's call
/// finished.
pub fn assert_starts_after_predecessors(graph: &ExecutionGraph, agent: &RecordingAgent) {
    for node in graph.nodes() {
        let Some(span) = agent.span(&node.id) else {
            continue;
        };
        for predecessor in graph.predecessors(&node.id) {
            if let Some(before) = agent.span(predecessor) {
                assert!(
                    span.started >= before.finished,
                    "Node '{}' started before predecessor '{predecessor}' finished",
                    node.id
                );
            }
        }
    }
}
