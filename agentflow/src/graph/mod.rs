//! Graph model: nodes, edges and topological leveling.
//!
//! Graphs are read-only inputs to a run. The scheduler validates them before
//! any node executes; cycles and missing required wiring are precondition
//! failures.

mod edge;
mod levels;
mod model;
mod node;

pub use edge::{type_name, Edge, Transformation, ValidationRule};
pub use levels::compute_levels;
pub use model::{ExecutionGraph, RunInputs};
pub use node::{Node, NodeConfig, SlotDecl};
