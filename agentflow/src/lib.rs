//! # Agentflow
//!
//! An execution orchestration engine for agent workflow graphs.
//!
//! Agentflow takes a directed acyclic graph of agent invocations and runs it:
//!
//! - **Level scheduling**: nodes run in topological levels through a bounded
//!   slot pool, with per-node timeouts and cancellation
//! - **Streaming**: outputs flow to consumers in batch, single-stream, tee or
//!   materialized form depending on size and fan-out
//! - **Stream resurrection**: closed streams can be replayed from checkpoints,
//!   with staleness validation and regeneration
//! - **Side-effect ledger**: external effects are journaled and compensated
//!   newest first on rollback
//! - **Snapshots**: runs are snapshotted between levels and can be resumed or
//!   restored
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agentflow::prelude::*;
//!
//! let graph = ExecutionGraph::new(
//!     vec![
//!         Node::new("fetch", "http"),
//!         Node::new("summarize", "llm").with_input(SlotDecl::required("document")),
//!     ],
//!     vec![Edge::new("fetch", "output", "summarize", "document")],
//! );
//!
//! let engine = Engine::builder(invoker).config(EngineConfig::default()).build()?;
//! let result = engine.run(&graph, &RunInputs::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod ledger;
pub mod monitor;
pub mod observability;
pub mod ports;
pub mod scheduler;
pub mod streaming;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{CompensationStrategy, ExecutionSnapshot, RestoreResult};
    pub use crate::config::EngineConfig;
    pub use crate::core::{ArtifactReference, NodeStatus};
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::errors::{EngineError, ErrorKind};
    pub use crate::events::{EngineEvent, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{Edge, ExecutionGraph, Node, NodeConfig, RunInputs, SlotDecl};
    pub use crate::ledger::{
        CompensationDescriptor, CompensationHandler, EffectRecorder, MatchRule, SideEffect,
    };
    pub use crate::ports::{
        AgentError, AgentInputs, AgentInvoker, AgentOutput, ArtifactStore, InvocationContext,
        WorkflowStateProvider,
    };
    pub use crate::scheduler::{
        ExecutionResult, FailurePolicy, NodeOutput, RetryConfig, RunOptions, RunStatus,
    };
    pub use crate::streaming::{StreamReader, StreamingStrategy, StreamingThresholds};
    pub use crate::utils::{generate_id, iso_timestamp, Timestamp};
}
