//! Snapshot persistence and restore.

use crate::config::CheckpointConfig;
use crate::errors::EngineError;
use crate::events::{names, EngineEvent, EventSink};
use crate::graph::RunInputs;
use crate::ledger::{CompensationReport, SideEffectEntry, SideEffectLedger};
use crate::ports::{load_record, save_record, RecordStore, EXECUTION_SNAPSHOTS};
use crate::scheduler::ExecutionState;
use crate::utils::{generate_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time copy of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Snapshot id.
    pub snapshot_id: Uuid,
    /// Run the snapshot belongs to.
    pub run_id: Uuid,
    /// When it was taken.
    pub created_at: Timestamp,
    /// Node states and bindings.
    pub state: ExecutionState,
    /// Caller-supplied run inputs, so the run can be resumed.
    #[serde(default)]
    pub inputs: RunInputs,
    /// Ledger position when the snapshot was taken.
    pub ledger_cursor: u64,
}

/// How restore deals with effects recorded after the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// Compensate them newest-first, halting on the first hard failure.
    #[default]
    Automatic,
    /// Return them for external review.
    Manual,
}

/// Outcome of [`CheckpointManager::restore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    /// The snapshot restored to.
    pub snapshot: ExecutionSnapshot,
    /// Strategy used.
    pub strategy: CompensationStrategy,
    /// Compensation performed, for [`CompensationStrategy::Automatic`].
    #[serde(default)]
    pub report: Option<CompensationReport>,
    /// Effects still awaiting compensation or a human, newest first.
    #[serde(default)]
    pub pending_effects: Vec<SideEffectEntry>,
}

impl RestoreResult {
    /// Returns true if nothing after the snapshot still needs undoing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.pending_effects.is_empty()
    }
}

/// Record id of a snapshot. Ids start with the run id so a run's snapshots
/// can be found without loading any of them.
fn record_id(run_id: Uuid, snapshot_id: Uuid) -> String {
    format!("{run_id}.{snapshot_id}")
}

fn run_prefix(run_id: Uuid) -> String {
    format!("{run_id}.")
}

/// Writes, lists and restores execution snapshots.
pub struct CheckpointManager {
    records: Arc<dyn RecordStore>,
    ledger: Arc<SideEffectLedger>,
    events: Arc<dyn EventSink>,
    config: CheckpointConfig,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        ledger: Arc<SideEffectLedger>,
        events: Arc<dyn EventSink>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            records,
            ledger,
            events,
            config,
        }
    }

    /// Whether the periodic cadence calls for a snapshot after
    /// `completed_levels` levels.
    #[must_use]
    pub fn is_due(&self, completed_levels: usize) -> bool {
        match self.config.snapshot_every_levels {
            Some(every) if every > 0 => completed_levels > 0 && completed_levels % every == 0,
            _ => false,
        }
    }

    /// Persists a snapshot of `state` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    pub async fn snapshot(
        &self,
        state: &ExecutionState,
        inputs: &RunInputs,
    ) -> Result<Uuid, EngineError> {
        let snapshot = ExecutionSnapshot {
            snapshot_id: generate_id(),
            run_id: state.run_id,
            created_at: now_utc(),
            state: state.clone(),
            inputs: inputs.clone(),
            ledger_cursor: self.ledger.cursor(),
        };
        let id = snapshot.snapshot_id;
        save_record(
            self.records.as_ref(),
            EXECUTION_SNAPSHOTS,
            &record_id(snapshot.run_id, id),
            &snapshot,
        )
        .await?;

        debug!(
            run_id = %snapshot.run_id,
            snapshot_id = %id,
            levels = snapshot.state.completed_levels,
            ledger_cursor = snapshot.ledger_cursor,
            "Execution snapshot written"
        );
        self.events.try_emit(
            EngineEvent::new(names::SNAPSHOT_CREATED)
                .with_run(snapshot.run_id)
                .with_data(json!({
                    "snapshot_id": id,
                    "completed_levels": snapshot.state.completed_levels,
                    "ledger_cursor": snapshot.ledger_cursor,
                })),
        );

        if let Err(e) = self.prune(snapshot.run_id).await {
            warn!(run_id = %snapshot.run_id, error = %e, "Snapshot pruning failed");
        }
        Ok(id)
    }

    /// Loads a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if no such snapshot exists.
    pub async fn load(&self, snapshot_id: Uuid) -> Result<ExecutionSnapshot, EngineError> {
        let suffix = format!(".{snapshot_id}");
        let not_found = || EngineError::NotFound(format!("execution snapshot {snapshot_id}"));
        let id = self
            .records
            .list(EXECUTION_SNAPSHOTS)
            .await?
            .into_iter()
            .find(|id| id.ends_with(&suffix))
            .ok_or_else(not_found)?;
        load_record(self.records.as_ref(), EXECUTION_SNAPSHOTS, &id)
            .await?
            .ok_or_else(not_found)
    }

    /// Snapshots of `run_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    pub async fn list(&self, run_id: Uuid) -> Result<Vec<ExecutionSnapshot>, EngineError> {
        let prefix = run_prefix(run_id);
        let mut snapshots = Vec::new();
        for id in self.records.list(EXECUTION_SNAPSHOTS).await? {
            if !id.starts_with(&prefix) {
                continue;
            }
            if let Some(snapshot) =
                load_record::<ExecutionSnapshot>(self.records.as_ref(), EXECUTION_SNAPSHOTS, &id)
                    .await?
            {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by_key(|s| (s.created_at, s.snapshot_id));
        Ok(snapshots)
    }

    /// Newest snapshot of `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    pub async fn latest(&self, run_id: Uuid) -> Result<Option<ExecutionSnapshot>, EngineError> {
        Ok(self.list(run_id).await?.pop())
    }

    /// Drops the oldest snapshots of `run_id` beyond the retention limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    pub async fn prune(&self, run_id: Uuid) -> Result<usize, EngineError> {
        let snapshots = self.list(run_id).await?;
        let excess = snapshots.len().saturating_sub(self.config.max_snapshots.max(1));
        for snapshot in &snapshots[..excess] {
            self.records
                .remove(EXECUTION_SNAPSHOTS, &record_id(run_id, snapshot.snapshot_id))
                .await?;
        }
        Ok(excess)
    }

    /// Rolls the run's side effects back to the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is missing or the ledger fails.
    /// Compensation failures are reported in the result.
    pub async fn restore(
        &self,
        snapshot_id: Uuid,
        strategy: CompensationStrategy,
    ) -> Result<RestoreResult, EngineError> {
        let snapshot = self.load(snapshot_id).await?;
        let run_id = snapshot.run_id;

        let (report, pending_effects) = match strategy {
            CompensationStrategy::Automatic => {
                let report = self
                    .ledger
                    .compensate_since(snapshot.ledger_cursor, Some(run_id))
                    .await?;
                let pending = report
                    .unresolved
                    .iter()
                    .filter_map(|id| self.ledger.get(*id))
                    .collect();
                (Some(report), pending)
            }
            CompensationStrategy::Manual => (
                None,
                self.ledger
                    .uncompensated_since(snapshot.ledger_cursor, Some(run_id)),
            ),
        };

        info!(
            run_id = %run_id,
            snapshot_id = %snapshot_id,
            strategy = ?strategy,
            pending = pending_effects.len(),
            "Restored to execution snapshot"
        );
        let event = if pending_effects.is_empty() {
            EngineEvent::new(names::SNAPSHOT_RESTORED)
        } else {
            EngineEvent::warning(names::SNAPSHOT_RESTORED)
        };
        self.events.try_emit(event.with_run(run_id).with_data(json!({
            "snapshot_id": snapshot_id,
            "strategy": strategy,
            "pending_effects": pending_effects.iter().map(|e| e.effect_id).collect::<Vec<_>>(),
            "halted_at": report.as_ref().and_then(|r| r.halted_at),
        })));

        Ok(RestoreResult {
            snapshot,
            strategy,
            report,
            pending_effects,
        })
    }

    /// The newest effect after the snapshot that still awaits compensation
    /// and is not already waiting on a human. Callers confirm it one at a
    /// time through the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is missing.
    pub async fn next_pending_effect(
        &self,
        snapshot_id: Uuid,
    ) -> Result<Option<SideEffectEntry>, EngineError> {
        let snapshot = self.load(snapshot_id).await?;
        Ok(self
            .ledger
            .uncompensated_since(snapshot.ledger_cursor, Some(snapshot.run_id))
            .into_iter()
            .find(|entry| !entry.requires_user_action))
    }
}
