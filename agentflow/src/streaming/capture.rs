//! Recording chunks as they flow past, for checkpointing.

use super::{ChunkStream, StreamFault};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Chunks observed on a stream so far.
///
/// With a window, only the first `window` chunks are retained; counters keep
/// tracking the whole stream.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    chunks: Vec<Value>,
    window: Option<usize>,
    total_chunks: u64,
    total_bytes: u64,
    complete: bool,
    fault: Option<String>,
}

/// Shared handle to a capture buffer.
pub type SharedCapture = Arc<Mutex<CaptureBuffer>>;

/// Point-in-time copy of a capture buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSnapshot {
    /// Retained chunks.
    pub chunks: Vec<Value>,
    /// Chunks observed in total.
    pub total_chunks: u64,
    /// Serialized bytes observed in total.
    pub total_bytes: u64,
    /// The stream ended without error.
    pub complete: bool,
    /// Retained chunks are a prefix of what was observed.
    pub truncated: bool,
}

impl CaptureBuffer {
    /// Creates a buffer retaining every chunk.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Creates a buffer retaining at most `window` chunks.
    #[must_use]
    pub fn windowed(window: usize) -> Self {
        Self {
            window: Some(window),
            ..Self::default()
        }
    }

    /// Wraps the buffer for sharing with a capturing stream.
    #[must_use]
    pub fn shared(self) -> SharedCapture {
        Arc::new(Mutex::new(self))
    }

    fn record(&mut self, chunk: &Value) {
        self.total_chunks += 1;
        self.total_bytes += chunk.to_string().len() as u64;
        if self.window.map_or(true, |w| self.chunks.len() < w) {
            self.chunks.push(chunk.clone());
        }
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            chunks: self.chunks.clone(),
            total_chunks: self.total_chunks,
            total_bytes: self.total_bytes,
            complete: self.complete,
            truncated: (self.chunks.len() as u64) < self.total_chunks,
        }
    }

    /// The stream ended without error.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Serialized bytes observed so far.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// The producer's error, if the stream failed.
    #[must_use]
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }
}

/// Wraps `stream` so every chunk is recorded into `buffer`.
#[must_use]
pub fn capture(stream: ChunkStream, buffer: SharedCapture) -> ChunkStream {
    let observer = buffer.clone();
    let tail = buffer;

    stream
        .inspect(move |item| {
            let mut buf = observer.lock();
            match item {
                Ok(chunk) => buf.record(chunk),
                Err(fault) => buf.fault = Some(fault.to_string()),
            }
        })
        .chain(
            futures::stream::once(async move {
                let mut buf = tail.lock();
                if buf.fault.is_none() {
                    buf.complete = true;
                }
                None::<Result<Value, StreamFault>>
            })
            .filter_map(futures::future::ready),
        )
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    #[tokio::test]
    async fn test_capture_full() {
        let buffer = CaptureBuffer::unbounded().shared();
        let source = stream::iter((0..5).map(|i| Ok(json!(i)))).boxed();

        let seen: Vec<_> = capture(source, buffer.clone()).collect().await;
        assert_eq!(seen.len(), 5);

        let snap = buffer.lock().snapshot();
        assert!(snap.complete);
        assert!(!snap.truncated);
        assert_eq!(snap.chunks, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_capture_window_keeps_prefix() {
        let buffer = CaptureBuffer::windowed(2).shared();
        let source = stream::iter((0..5).map(|i| Ok(json!(i)))).boxed();

        let _: Vec<_> = capture(source, buffer.clone()).collect().await;

        let snap = buffer.lock().snapshot();
        assert_eq!(snap.chunks, vec![json!(0), json!(1)]);
        assert_eq!(snap.total_chunks, 5);
        assert!(snap.truncated);
    }

    #[tokio::test]
    async fn test_capture_fault_is_not_complete() {
        let buffer = CaptureBuffer::unbounded().shared();
        let source = stream::iter(vec![Ok(json!(1)), Err(StreamFault::new("boom"))]).boxed();

        let _: Vec<_> = capture(source, buffer.clone()).collect().await;

        let buf = buffer.lock();
        assert!(!buf.is_complete());
        assert_eq!(buf.fault(), Some("boom"));
    }

    #[tokio::test]
    async fn test_partial_read_is_not_complete() {
        let buffer = CaptureBuffer::unbounded().shared();
        let source = stream::iter((0..5).map(|i| Ok(json!(i)))).boxed();

        let mut wrapped = capture(source, buffer.clone());
        let _ = wrapped.next().await;

        assert!(!buffer.lock().is_complete());
        assert_eq!(buffer.lock().snapshot().total_chunks, 1);
    }
}
