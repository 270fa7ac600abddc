//! Wide run summaries: one event carrying everything about a finished run.

use crate::events::{names, EngineEvent, EventSink};
use crate::scheduler::ExecutionResult;
use std::collections::BTreeMap;

/// Emitter for wide events (comprehensive run payloads).
#[derive(Debug, Clone)]
pub struct WideEventEmitter {
    /// Event type of the run summary.
    pub event_type: String,
    /// Include a per-node detail array.
    pub include_nodes: bool,
}

impl Default for WideEventEmitter {
    fn default() -> Self {
        Self {
            event_type: names::RUN_WIDE.to_string(),
            include_nodes: true,
        }
    }
}

impl WideEventEmitter {
    /// Creates a new wide event emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the run payload.
    #[must_use]
    pub fn build_run_payload(&self, result: &ExecutionResult) -> serde_json::Value {
        let mut status_counts: BTreeMap<String, u32> = BTreeMap::new();
        for node in result.state.nodes().values() {
            *status_counts.entry(node.status.to_string()).or_insert(0) += 1;
        }

        let mut payload = serde_json::json!({
            "run_id": result.run_id.to_string(),
            "status": result.status,
            "duration_ms": result.duration_ms,
            "levels": result.levels.len(),
            "node_counts": status_counts,
            "failed_nodes": result.failures.failed_nodes,
            "skipped_nodes": result.failures.skipped_nodes,
            "snapshot_id": result.snapshot_id.map(|id| id.to_string()),
        });

        if let Some(err) = &result.error {
            payload["error"] = serde_json::json!(err);
        }
        if let Some(report) = &result.compensation {
            payload["compensation"] = serde_json::json!({
                "compensated": report.compensated(),
                "unresolved": report.unresolved.len(),
                "complete": report.is_complete(),
            });
        }

        if self.include_nodes {
            let mut nodes: Vec<_> = result.state.nodes().values().collect();
            // Nodes that never started have no level and go last.
            nodes.sort_by_key(|node| (node.level.is_none(), node.level, node.node_id.clone()));
            payload["nodes"] = nodes
                .into_iter()
                .map(|node| {
                    serde_json::json!({
                        "node_id": node.node_id,
                        "status": node.status.to_string(),
                        "level": node.level,
                        "strategy": node.strategy,
                        "duration_ms": node.duration_ms(),
                        "retries": node.retry_count,
                        "error": node.error,
                    })
                })
                .collect();
        }

        payload
    }

    /// Emits the run wide event.
    pub fn emit_run_event(&self, sink: &dyn EventSink, result: &ExecutionResult) {
        let payload = self.build_run_payload(result);
        sink.try_emit(
            EngineEvent::new(self.event_type.clone())
                .with_run(result.run_id)
                .with_data(payload),
        );
    }
}
