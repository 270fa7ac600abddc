//! Testing utilities for agentflow graphs.
//!
//! This module provides:
//! - Mock agents (scripted, failing, slow, streaming, recording)
//! - Graph fixtures
//! - Assertions over run results

mod assertions;
mod fixtures;
mod mocks;

pub use crate::events::CollectingEventSink;
pub use assertions::{
    assert_levels_respect_edges, assert_node_status, assert_run_status,
    assert_starts_after_predecessors,
};
pub use fixtures::{diamond_graph, fan_out_graph, linear_graph};
pub use mocks::{
    CallSpan, FailingAgent, Invocation, RecordingAgent, ScriptedAgent, SlowAgent, StreamingAgent,
};
