//! Engine event system.
//!
//! Events are fire-and-forget status, warning and error notifications for
//! UIs and operators. A sink is injected per engine; emission never blocks
//! execution.

mod sink;
mod types;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
pub use types::{names, EngineEvent, EventSeverity};
