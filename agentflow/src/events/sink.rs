//! Event sink trait and implementations.

use super::types::{EngineEvent, EventSeverity};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn, Level};

/// Receiver of engine events.
///
/// Sinks are injected into an engine instance; there is no process-wide
/// sink. The engine only calls [`EventSink::try_emit`], which must not block.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event, possibly waiting for the sink.
    async fn emit(&self, event: EngineEvent);

    /// Emits an event without blocking. Errors are logged and suppressed.
    fn try_emit(&self, event: EngineEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: EngineEvent) {}

    fn try_emit(&self, _event: EngineEvent) {}
}

/// A sink that forwards events to `tracing`.
///
/// Warnings and errors are always logged at their own level; routine events
/// use the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging routine events at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &EngineEvent) {
        let run_id = event.run_id.map(|id| id.to_string()).unwrap_or_default();
        let node_id = event.node_id.as_deref().unwrap_or_default();
        let stream_id = event.stream_id.map(|id| id.to_string()).unwrap_or_default();

        match (event.severity, self.level) {
            (EventSeverity::Error, _) => error!(
                event_type = %event.event_type, %run_id, node_id, %stream_id,
                data = %event.data, "engine event"
            ),
            (EventSeverity::Warning, _) => warn!(
                event_type = %event.event_type, %run_id, node_id, %stream_id,
                data = %event.data, "engine event"
            ),
            (EventSeverity::Info, Level::DEBUG | Level::TRACE) => debug!(
                event_type = %event.event_type, %run_id, node_id, %stream_id,
                data = %event.data, "engine event"
            ),
            (EventSeverity::Info, _) => info!(
                event_type = %event.event_type, %run_id, node_id, %stream_id,
                data = %event.data, "engine event"
            ),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: EngineEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: EngineEvent) {
        self.log_event(&event);
    }
}

/// A sink that keeps every event in memory, for tests and UIs that poll.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<EngineEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns events concerning `node_id`.
    #[must_use]
    pub fn events_for_node(&self, node_id: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.node_id.as_deref() == Some(node_id))
            .cloned()
            .collect()
    }

    /// Returns warning and error events.
    #[must_use]
    pub fn warnings(&self) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.severity != EventSeverity::Info)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: EngineEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: EngineEvent) {
        self.events.write().push(event);
    }
}
