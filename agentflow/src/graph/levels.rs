//! Kahn topological leveling.

use super::model::ExecutionGraph;
use crate::errors::CycleDetectedError;
use std::collections::{HashMap, HashSet};

/// Groups nodes into levels: a node's level is strictly greater than the
/// level of each of its predecessors.
///
/// Nodes within a level keep declaration order, which callers must not rely
/// on for scheduling.
///
/// # Errors
///
/// Returns [`CycleDetectedError`] with one concrete cycle path when a round
/// of leveling finds no ready node while nodes remain.
pub fn compute_levels(graph: &ExecutionGraph) -> Result<Vec<Vec<String>>, CycleDetectedError> {
    let mut in_degree: HashMap<&str, usize> = graph
        .nodes()
        .iter()
        .map(|n| (n.id.as_str(), 0))
        .collect();

    for node in graph.nodes() {
        for pred in graph.predecessors(&node.id) {
            if in_degree.contains_key(pred) {
                *in_degree.entry(node.id.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut remaining: Vec<&str> = graph.nodes().iter().map(|n| n.id.as_str()).collect();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
            .collect();

        if ready.is_empty() {
            return Err(CycleDetectedError::new(find_cycle(graph, &remaining)));
        }

        let ready_set: HashSet<&str> = ready.iter().copied().collect();
        remaining.retain(|id| !ready_set.contains(id));

        for id in &ready {
            for succ in graph.successors(id) {
                if let Some(count) = in_degree.get_mut(succ) {
                    *count = count.saturating_sub(1);
                }
            }
        }

        levels.push(ready.into_iter().map(String::from).collect());
    }

    Ok(levels)
}

/// Walks predecessors among the stuck nodes until one repeats.
///
/// Every stuck node has a stuck predecessor, so the walk always closes.
fn find_cycle(graph: &ExecutionGraph, stuck: &[&str]) -> Vec<String> {
    let stuck_set: HashSet<&str> = stuck.iter().copied().collect();
    let Some(&start) = stuck.first() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut position: HashMap<&str, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let next = graph
            .predecessors(current)
            .into_iter()
            .find(|p| stuck_set.contains(p));
        let Some(next) = next else {
            return path.into_iter().map(String::from).collect();
        };
        if let Some(&at) = position.get(next) {
            let mut cycle = vec![next.to_string()];
            cycle.extend(path[at..].iter().rev().map(|s| (*s).to_string()));
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
