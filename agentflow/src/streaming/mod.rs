//! Streaming outputs: strategy selection, tee, capture, checkpointing and
//! resurrection.

mod capture;
mod checkpoint;
mod lifecycle;
mod materialize;
mod reader;
mod staleness;
mod strategy;
mod tee;

pub use capture::{capture, CaptureBuffer, CaptureSnapshot, SharedCapture};
pub use checkpoint::{CheckpointStatus, MaterializationMode, StreamCheckpoint};
pub use lifecycle::{StreamHandle, StreamLifecycleManager, StreamProducer};
pub use materialize::{materialize, replay, MaterializedStream};
pub use reader::{ChunkSource, DegradationWarning, Provenance, StreamReader};
pub use staleness::{inputs_version, StalenessReport, StalenessSeverity, StalenessValidator};
pub use strategy::{
    AgentHints, StrategyInput, StrategySelector, StreamingStrategy, StreamingThresholds,
    ThresholdKind, ThresholdRecommendation,
};
pub use tee::{tee2, tee_n};

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A stream of JSON chunks produced by an agent.
pub type ChunkStream = BoxStream<'static, Result<Value, StreamFault>>;

/// An error carried inside a chunk stream.
///
/// Faults are cloneable so a tee can hand the same failure to every branch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StreamFault {
    /// What went wrong.
    pub message: String,
}

impl StreamFault {
    /// Creates a fault.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Builds a chunk stream from values already in memory.
#[must_use]
pub fn from_chunks(chunks: Vec<Value>) -> ChunkStream {
    use futures::StreamExt;
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}
