//! Graph fixtures.

use crate::graph::{Edge, ExecutionGraph, Node, SlotDecl};

/// `ids[0] -> ids[1] -> ...`, each node's `output` wired to the next
/// node's optional `in` slot. Nodes use the `echo` agent type.
#[must_use]
pub fn linear_graph(ids: &[&str]) -> ExecutionGraph {
    let nodes = ids
        .iter()
        .map(|id| Node::new(*id, "echo").with_input(SlotDecl::optional("in")))
        .collect();
    let edges = ids
        .windows(2)
        .map(|pair| Edge::new(pair[0], "output", pair[1], "in"))
        .collect();
    ExecutionGraph::new(nodes, edges)
}

/// `a` feeds `b` and `c`, which both feed `d` (slots `left` and `right`).
#[must_use]
pub fn diamond_graph() -> ExecutionGraph {
    ExecutionGraph::new(
        vec![
            Node::new("a", "echo"),
            Node::new("b", "echo").with_input(SlotDecl::required("in")),
            Node::new("c", "echo").with_input(SlotDecl::required("in")),
            Node::new("d", "echo")
                .with_input(SlotDecl::required("left"))
                .with_input(SlotDecl::required("right")),
        ],
        vec![
            Edge::new("a", "output", "b", "in"),
            Edge::new("a", "output", "c", "in"),
            Edge::new("b", "output", "d", "left"),
            Edge::new("c", "output", "d", "right"),
        ],
    )
}

/// `source` feeds `consumers` sibling nodes `c0..cN`, all in one level.
#[must_use]
pub fn fan_out_graph(source: Node, consumers: usize) -> ExecutionGraph {
    let source_id = source.id.clone();
    let mut nodes = vec![source];
    let mut edges = Vec::with_capacity(consumers);
    for i in 0..consumers {
        let id = format!("c{i}");
        nodes.push(Node::new(id.clone(), "echo").with_input(SlotDecl::required("in")));
        edges.push(Edge::new(source_id.clone(), "output", id, "in"));
    }
    ExecutionGraph::new(nodes, edges)
}
