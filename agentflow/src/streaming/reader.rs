//! Consumer-side stream readers.

use super::staleness::StalenessSeverity;
use super::{ChunkStream, StreamFault};
use crate::cancellation::CancellationToken;
use futures::stream::{self, Stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use uuid::Uuid;

/// Where a reader's chunks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSource {
    /// The producer, as it runs.
    Live,
    /// Stored chunks, materialized or checkpointed.
    Cache,
    /// A re-invocation of the producer.
    Regenerated,
}

/// A warning attached to degraded data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationWarning {
    /// How stale the underlying checkpoint was.
    pub severity: StalenessSeverity,
    /// What the consumer should know.
    pub message: String,
}

/// Provenance of the data a reader yields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Origin of the chunks.
    pub source: ChunkSource,
    /// Staleness of the checkpoint, `Fresh` for live streams.
    pub severity: StalenessSeverity,
    /// Warnings raised while producing this reader.
    pub warnings: Vec<DegradationWarning>,
}

impl Provenance {
    /// Provenance of a live stream.
    #[must_use]
    pub fn live() -> Self {
        Self {
            source: ChunkSource::Live,
            severity: StalenessSeverity::Fresh,
            warnings: Vec::new(),
        }
    }

    /// Provenance of stored chunks with the given staleness.
    #[must_use]
    pub fn cached(severity: StalenessSeverity) -> Self {
        Self {
            source: ChunkSource::Cache,
            severity,
            warnings: Vec::new(),
        }
    }

    /// Provenance of a regenerated stream.
    #[must_use]
    pub fn regenerated(severity: StalenessSeverity) -> Self {
        Self {
            source: ChunkSource::Regenerated,
            severity,
            warnings: Vec::new(),
        }
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(DegradationWarning {
            severity: self.severity,
            message: message.into(),
        });
        self
    }

    /// True when the data must not be presented as fresh.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty() || self.severity != StalenessSeverity::Fresh
    }
}

/// One consumer's view of a stream.
pub struct StreamReader {
    stream_id: Uuid,
    consumer_index: usize,
    provenance: Provenance,
    inner: ChunkStream,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("stream_id", &self.stream_id)
            .field("consumer_index", &self.consumer_index)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

impl StreamReader {
    /// Wraps a chunk stream.
    #[must_use]
    pub fn new(
        stream_id: Uuid,
        consumer_index: usize,
        provenance: Provenance,
        inner: ChunkStream,
    ) -> Self {
        Self {
            stream_id,
            consumer_index,
            provenance,
            inner,
        }
    }

    /// The stream this reader belongs to.
    #[must_use]
    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// This reader's consumer slot.
    #[must_use]
    pub fn consumer_index(&self) -> usize {
        self.consumer_index
    }

    /// Where the chunks come from.
    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Applies `f` to every chunk; an `Err` becomes a stream fault.
    #[must_use]
    pub fn map_chunks<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + 'static,
    {
        let inner = self
            .inner
            .map(move |item| item.and_then(|chunk| f(chunk).map_err(StreamFault::new)))
            .boxed();
        Self { inner, ..self }
    }

    /// Ends the stream with a fault once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(self, token: &CancellationToken) -> Self {
        let until = token.clone();
        let after = token.clone();
        let inner = self
            .inner
            .take_until(async move { until.cancelled().await })
            .chain(
                stream::once(async move {
                    after.is_cancelled().then(|| {
                        Err(StreamFault::new(format!(
                            "stream cancelled: {}",
                            after.reason().unwrap_or_default()
                        )))
                    })
                })
                .filter_map(futures::future::ready),
            )
            .boxed();
        Self { inner, ..self }
    }

    /// Reads every chunk.
    ///
    /// # Errors
    ///
    /// Returns the first fault on the stream.
    pub async fn collect_chunks(mut self) -> Result<Vec<Value>, StreamFault> {
        let mut chunks = Vec::new();
        while let Some(item) = self.inner.next().await {
            chunks.push(item?);
        }
        Ok(chunks)
    }

    /// Reads every chunk into a JSON array.
    ///
    /// # Errors
    ///
    /// Returns the first fault on the stream.
    pub async fn collect_value(self) -> Result<Value, StreamFault> {
        self.collect_chunks().await.map(Value::Array)
    }

}

impl Stream for StreamReader {
    type Item = Result<Value, StreamFault>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
