//! Stream-vs-batch selection per node.
//!
//! The selector only decides *how* output flows; every strategy delivers the
//! same data to every consumer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a node's output is delivered to its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingStrategy {
    /// Run to completion, hand consumers a value.
    Batch,
    /// Stream to a single consumer.
    StreamSingle,
    /// Stream to several consumers through a bounded tee.
    StreamTee,
    /// Stream into the artifact store, consumers replay from there.
    StreamMaterialize,
}

impl StreamingStrategy {
    /// Returns true for the streaming strategies.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        !matches!(self, Self::Batch)
    }
}

impl fmt::Display for StreamingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::StreamSingle => write!(f, "stream_single"),
            Self::StreamTee => write!(f, "stream_tee"),
            Self::StreamMaterialize => write!(f, "stream_materialize"),
        }
    }
}

/// Adaptive thresholds. Only changed through monitor recommendations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingThresholds {
    /// Inputs larger than this stream by default.
    #[serde(default = "default_large_input")]
    pub large_input_bytes: u64,
    /// Multi-consumer outputs smaller than this are teed, larger ones
    /// materialized.
    #[serde(default = "default_tee_threshold")]
    pub tee_threshold_bytes: u64,
    /// Fan-outs above this are always materialized.
    #[serde(default = "default_max_tee_consumers")]
    pub max_tee_consumers: usize,
}

fn default_large_input() -> u64 {
    1024 * 1024
}

fn default_tee_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_max_tee_consumers() -> usize {
    4
}

impl Default for StreamingThresholds {
    fn default() -> Self {
        Self {
            large_input_bytes: default_large_input(),
            tee_threshold_bytes: default_tee_threshold(),
            max_tee_consumers: default_max_tee_consumers(),
        }
    }
}

/// Which threshold a recommendation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    /// [`StreamingThresholds::large_input_bytes`]
    LargeInput,
    /// [`StreamingThresholds::tee_threshold_bytes`]
    Tee,
    /// [`StreamingThresholds::max_tee_consumers`]
    MaxTeeConsumers,
}

/// An advisory threshold change produced by the performance monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRecommendation {
    /// Threshold to change.
    pub threshold: ThresholdKind,
    /// Current value.
    pub current: u64,
    /// Recommended value.
    pub recommended: u64,
    /// Human-readable reason.
    pub reason: String,
}

impl StreamingThresholds {
    /// Sets the large input threshold.
    #[must_use]
    pub fn with_large_input_bytes(mut self, bytes: u64) -> Self {
        self.large_input_bytes = bytes;
        self
    }

    /// Sets the tee threshold.
    #[must_use]
    pub fn with_tee_threshold_bytes(mut self, bytes: u64) -> Self {
        self.tee_threshold_bytes = bytes;
        self
    }

    /// Sets the maximum tee fan-out.
    #[must_use]
    pub fn with_max_tee_consumers(mut self, consumers: usize) -> Self {
        self.max_tee_consumers = consumers;
        self
    }

    /// Applies recommendations, returning the new thresholds.
    #[must_use]
    pub fn apply(&self, recommendations: &[ThresholdRecommendation]) -> Self {
        let mut next = self.clone();
        for rec in recommendations {
            match rec.threshold {
                ThresholdKind::LargeInput => next.large_input_bytes = rec.recommended.max(1),
                ThresholdKind::Tee => next.tee_threshold_bytes = rec.recommended.max(1),
                ThresholdKind::MaxTeeConsumers => {
                    next.max_tee_consumers =
                        usize::try_from(rec.recommended).unwrap_or(usize::MAX).max(2);
                }
            }
        }
        next
    }
}

/// Agent-type hints consulted by the selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHints {
    /// Typical output size for this agent type.
    #[serde(default)]
    pub typical_output_bytes: Option<u64>,
}

/// Everything the selector needs to know about one node.
#[derive(Debug, Clone, Default)]
pub struct StrategyInput {
    /// Explicit streaming preference from the node config.
    pub declared: Option<bool>,
    /// Whether any resolved input is itself a stream.
    pub has_streamed_input: bool,
    /// Sum of known resolved input sizes.
    pub input_bytes: u64,
    /// Number of consumers of the output.
    pub fan_out: usize,
    /// Declared estimate of the output size.
    pub estimated_output_bytes: Option<u64>,
    /// Agent-type hints.
    pub hints: AgentHints,
    /// Consumers will not all be reading at the same time (different levels,
    /// or a level wider than the execution pool). A tee would stall on the
    /// slowest branch, so these outputs are materialized.
    pub consumers_staggered: bool,
}

impl StrategyInput {
    /// Best available estimate of the output size.
    #[must_use]
    pub fn output_estimate(&self) -> u64 {
        self.estimated_output_bytes
            .or(self.hints.typical_output_bytes)
            .unwrap_or(self.input_bytes)
    }
}

/// Picks a [`StreamingStrategy`] from thresholds and node facts.
#[derive(Debug, Clone, Default)]
pub struct StrategySelector {
    thresholds: StreamingThresholds,
}

impl StrategySelector {
    /// Creates a selector.
    #[must_use]
    pub fn new(thresholds: StreamingThresholds) -> Self {
        Self { thresholds }
    }

    /// The active thresholds.
    #[must_use]
    pub fn thresholds(&self) -> &StreamingThresholds {
        &self.thresholds
    }

    /// Selects the strategy. The first matching rule wins:
    ///
    /// 1. explicit `false` is batch;
    /// 2. explicit `true` or a streamed input streams;
    /// 3. an input above the large-input threshold streams;
    /// 4. fan-out of at most one is a single stream;
    /// 5. larger fan-outs tee when the estimated output is under the tee
    ///    threshold and the fan-out within the tee bound, and materialize
    ///    otherwise.
    ///
    /// Only rule 1 yields batch.
    #[must_use]
    pub fn select(&self, input: &StrategyInput) -> StreamingStrategy {
        if input.declared == Some(false) {
            return StreamingStrategy::Batch;
        }

        if input.fan_out <= 1 {
            return StreamingStrategy::StreamSingle;
        }

        if !input.consumers_staggered
            && input.output_estimate() < self.thresholds.tee_threshold_bytes
            && input.fan_out <= self.thresholds.max_tee_consumers
        {
            StreamingStrategy::StreamTee
        } else {
            StreamingStrategy::StreamMaterialize
        }
    }

    /// Which rule made the node stream, reported with the selection.
    #[must_use]
    pub fn reason(&self, input: &StrategyInput) -> &'static str {
        match input.declared {
            Some(false) => "declared_batch",
            Some(true) => "declared_streaming",
            None if input.has_streamed_input => "streamed_input",
            None if input.input_bytes > self.thresholds.large_input_bytes => "large_input",
            None => "fan_out",
        }
    }
}
