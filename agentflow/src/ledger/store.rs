//! The append-only side-effect ledger.

use super::entry::{
    CompensationDescriptor, CompensationReport, CompensationResult, EffectStatus, SideEffect,
    SideEffectEntry,
};
use super::journal::LedgerJournal;
use super::registry::{CompensationRegistry, HandlerOutcome};
use crate::config::LedgerConfig;
use crate::errors::{CompensationError, EngineError};
use crate::events::{names, EngineEvent, EventSink};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<SideEffectEntry>,
    /// Effect id to the index of its newest entry.
    latest: HashMap<Uuid, usize>,
    /// Effect id to the seq of its first entry.
    origin: HashMap<Uuid, u64>,
    by_node: HashMap<String, Vec<Uuid>>,
    by_run: HashMap<Uuid, Vec<Uuid>>,
    /// Effects that reached `Executed` at some point.
    executed: HashSet<Uuid>,
}

impl LedgerState {
    fn index(&mut self, entry: SideEffectEntry) {
        let idx = self.entries.len();
        let effect_id = entry.effect_id;
        if !self.origin.contains_key(&effect_id) {
            self.origin.insert(effect_id, entry.seq);
            self.by_node
                .entry(entry.node_id.clone())
                .or_default()
                .push(effect_id);
            self.by_run.entry(entry.run_id).or_default().push(effect_id);
        }
        if entry.status == EffectStatus::Executed {
            self.executed.insert(effect_id);
        }
        self.latest.insert(effect_id, idx);
        self.entries.push(entry);
    }

    fn latest(&self, effect_id: Uuid) -> Option<&SideEffectEntry> {
        self.latest.get(&effect_id).map(|&idx| &self.entries[idx])
    }

    fn next_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    fn was_executed(&self, effect_id: Uuid) -> bool {
        self.executed.contains(&effect_id)
    }

    fn latest_of(&self, ids: &[Uuid]) -> Vec<SideEffectEntry> {
        ids.iter()
            .filter_map(|id| self.latest(*id).cloned())
            .collect()
    }
}

/// Append-only record of externally visible operations.
///
/// Status changes never rewrite an entry; they append a new entry carrying
/// the original effect id. Compensation runs one effect at a time.
///
/// Writers are serialized by `writer`; the state lock is only taken to read
/// or to index an entry that is already journaled, so readers never wait on
/// disk.
pub struct SideEffectLedger {
    state: RwLock<LedgerState>,
    writer: Mutex<()>,
    journal: Option<LedgerJournal>,
    registry: Arc<CompensationRegistry>,
    config: LedgerConfig,
    events: Arc<dyn EventSink>,
    compensation_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SideEffectLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffectLedger")
            .field("entries", &self.state.read().entries.len())
            .field("journal", &self.journal.as_ref().map(LedgerJournal::path))
            .finish_non_exhaustive()
    }
}

impl SideEffectLedger {
    /// Creates an in-memory ledger.
    #[must_use]
    pub fn new(
        registry: Arc<CompensationRegistry>,
        config: LedgerConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            writer: Mutex::new(()),
            journal: None,
            registry,
            config,
            events,
            compensation_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens a journaled ledger, replaying the entries already written.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be opened or parsed.
    pub fn open(
        path: impl AsRef<Path>,
        registry: Arc<CompensationRegistry>,
        config: LedgerConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        let (journal, entries) = LedgerJournal::open(path)?;
        let mut state = LedgerState::default();
        for entry in entries {
            state.index(entry);
        }
        info!(
            path = %journal.path().display(),
            entries = state.entries.len(),
            effects = state.latest.len(),
            "Opened side-effect ledger"
        );
        Ok(Self {
            state: RwLock::new(state),
            writer: Mutex::new(()),
            journal: Some(journal),
            registry,
            config,
            events,
            compensation_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Opens the journal named by `config`, or builds an in-memory ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured journal cannot be opened.
    pub fn from_config(
        registry: Arc<CompensationRegistry>,
        config: LedgerConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        match config.journal_path.clone() {
            Some(path) => Self::open(path, registry, config, events),
            None => Ok(Self::new(registry, config, events)),
        }
    }

    /// The handler registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CompensationRegistry> {
        &self.registry
    }

    /// Journals `entry`, then indexes it. Callers hold `writer`.
    fn commit(&self, entry: SideEffectEntry) -> Result<(), EngineError> {
        if let Some(journal) = &self.journal {
            journal.append(&entry)?;
        }
        self.state.write().index(entry);
        Ok(())
    }

    /// Records a new pending effect and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn append(
        &self,
        run_id: Uuid,
        node_id: impl Into<String>,
        effect: SideEffect,
    ) -> Result<Uuid, EngineError> {
        let entry = {
            let _writer = self.writer.lock();
            let seq = self.state.read().next_seq();
            let entry = SideEffectEntry::first(seq, run_id, node_id.into(), effect);
            self.commit(entry.clone())?;
            entry
        };

        debug!(
            effect_id = %entry.effect_id,
            node_id = %entry.node_id,
            run_id = %run_id,
            operation = %entry.effect.operation,
            "Recorded side effect"
        );
        self.events.try_emit(
            EngineEvent::new(names::EFFECT_RECORDED)
                .with_run(run_id)
                .with_node(entry.node_id.clone())
                .with_data(json!({
                    "effect_id": entry.effect_id,
                    "operation": entry.effect.operation,
                    "compensation": entry.effect.compensation.kind(),
                })),
        );
        Ok(entry.effect_id)
    }

    fn transition(
        &self,
        effect_id: Uuid,
        status: EffectStatus,
        fill: impl FnOnce(&mut SideEffectEntry),
    ) -> Result<SideEffectEntry, EngineError> {
        let _writer = self.writer.lock();
        let next = {
            let state = self.state.read();
            let current = state
                .latest(effect_id)
                .ok_or(CompensationError::UnknownEffect(effect_id))?;
            if !current.status.can_transition_to(status) {
                return Err(CompensationError::InvalidTransition {
                    id: effect_id,
                    from: current.status.to_string(),
                    to: status.to_string(),
                }
                .into());
            }
            let mut next = current.transition(state.next_seq(), status);
            fill(&mut next);
            next
        };
        self.commit(next.clone())?;
        Ok(next)
    }

    /// Marks an effect as performed.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown effects or disallowed transitions.
    pub fn mark_executed(&self, effect_id: Uuid, result: Value) -> Result<(), EngineError> {
        self.transition(effect_id, EffectStatus::Executed, |e| e.result = Some(result))?;
        Ok(())
    }

    /// Marks the operation itself as failed.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown effects or disallowed transitions.
    pub fn mark_failed(&self, effect_id: Uuid, error: impl Into<String>) -> Result<(), EngineError> {
        let error = error.into();
        self.transition(effect_id, EffectStatus::Failed, |e| e.error = Some(error))?;
        Ok(())
    }

    /// Appends an entry that keeps the current status but flags the effect for
    /// a human.
    fn flag_user_action(
        &self,
        effect_id: Uuid,
        steps: &[String],
    ) -> Result<(), EngineError> {
        let _writer = self.writer.lock();
        let next = {
            let state = self.state.read();
            let current = state
                .latest(effect_id)
                .ok_or(CompensationError::UnknownEffect(effect_id))?;
            let mut next = current.transition(state.next_seq(), current.status);
            next.requires_user_action = true;
            next.manual_steps = steps.to_vec();
            next
        };
        self.commit(next)
    }

    /// Compensates one effect.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown effects or journal failures. Handler
    /// failures are reported in the result, not as errors.
    pub async fn compensate(&self, effect_id: Uuid) -> Result<CompensationResult, EngineError> {
        let _guard = self.compensation_lock.lock().await;
        self.compensate_locked(effect_id).await
    }

    async fn compensate_locked(&self, effect_id: Uuid) -> Result<CompensationResult, EngineError> {
        let (entry, executed) = {
            let state = self.state.read();
            let entry = state
                .latest(effect_id)
                .cloned()
                .ok_or(CompensationError::UnknownEffect(effect_id))?;
            let executed = state.was_executed(effect_id);
            (entry, executed)
        };

        let result = match entry.status {
            EffectStatus::Compensated => {
                return Ok(CompensationResult::done(effect_id, "Already compensated"));
            }
            EffectStatus::Failed if !executed => {
                return Ok(CompensationResult::done(
                    effect_id,
                    "Operation never took effect; nothing to compensate",
                ));
            }
            EffectStatus::Pending => {
                let steps = vec![format!(
                    "Check whether '{}' ({}) took effect and undo it if so",
                    entry.effect.description, entry.effect.operation
                )];
                self.flag_user_action(effect_id, &steps)?;
                CompensationResult::user_action(effect_id, steps, "Outcome of pending effect is unknown")
            }
            EffectStatus::Executed | EffectStatus::Failed => self.run_compensation(&entry).await?,
        };

        self.report(&entry, &result);
        Ok(result)
    }

    async fn run_compensation(
        &self,
        entry: &SideEffectEntry,
    ) -> Result<CompensationResult, EngineError> {
        let effect_id = entry.effect_id;
        let (reverse, manual) = match &entry.effect.compensation {
            CompensationDescriptor::Idempotent => {
                self.transition(effect_id, EffectStatus::Compensated, |e| {
                    e.result = Some(json!({"noop": true}));
                })?;
                return Ok(CompensationResult::done(effect_id, "Idempotent effect; no action needed"));
            }
            CompensationDescriptor::Irreversible { manual_steps } => {
                self.flag_user_action(effect_id, manual_steps)?;
                return Ok(CompensationResult::user_action(
                    effect_id,
                    manual_steps.clone(),
                    "Irreversible effect requires manual action",
                ));
            }
            CompensationDescriptor::Reversible { reverse_op, .. } => {
                (reverse_op.clone(), format!("Run '{reverse_op}' manually"))
            }
            CompensationDescriptor::Eventual {
                compensating_call, ..
            } => (
                compensating_call.clone(),
                format!("Issue '{compensating_call}' manually"),
            ),
        };

        let Some(handler) = self.registry.find(entry) else {
            let steps = vec![
                format!(
                    "No compensation handler matches '{}' ({})",
                    entry.effect.operation, entry.effect.description
                ),
                manual,
            ];
            self.flag_user_action(effect_id, &steps)?;
            return Ok(CompensationResult::user_action(effect_id, steps, "No matching handler"));
        };

        let timeout = self.config.compensation_timeout();
        let outcome = match tokio::time::timeout(timeout, handler.compensate(entry)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!(
                "Compensation '{reverse}' timed out after {}ms",
                timeout.as_millis()
            )),
        };

        match outcome {
            Ok(HandlerOutcome::Compensated(value)) => {
                self.transition(effect_id, EffectStatus::Compensated, |e| e.result = Some(value))?;
                Ok(CompensationResult::done(effect_id, format!("Compensated via '{reverse}'")))
            }
            Ok(HandlerOutcome::RequiresUserAction(steps)) => {
                self.flag_user_action(effect_id, &steps)?;
                Ok(CompensationResult::user_action(
                    effect_id,
                    steps,
                    format!("Handler for '{reverse}' needs manual action"),
                ))
            }
            Err(message) => {
                let steps = vec![manual];
                let recorded = message.clone();
                let flagged = steps.clone();
                self.transition(effect_id, EffectStatus::Failed, move |e| {
                    e.error = Some(recorded);
                    e.requires_user_action = true;
                    e.manual_steps = flagged;
                })?;
                Ok(CompensationResult::failed(effect_id, steps, message))
            }
        }
    }

    fn report(&self, entry: &SideEffectEntry, result: &CompensationResult) {
        let data = json!({
            "effect_id": entry.effect_id,
            "operation": entry.effect.operation,
            "message": result.message,
            "requires_user_action": result.requires_user_action,
            "manual_steps": result.manual_steps,
        });
        let event = if result.success {
            info!(effect_id = %entry.effect_id, node_id = %entry.node_id, "{}", result.message);
            EngineEvent::new(names::EFFECT_COMPENSATED)
        } else if result.halted {
            error!(effect_id = %entry.effect_id, node_id = %entry.node_id, error = %result.message, "Compensation failed");
            EngineEvent::error(names::COMPENSATION_FAILED)
        } else {
            warn!(effect_id = %entry.effect_id, node_id = %entry.node_id, "{}", result.message);
            EngineEvent::warning(names::COMPENSATION_FAILED)
        };
        self.events.try_emit(
            event
                .with_run(entry.run_id)
                .with_node(entry.node_id.clone())
                .with_data(data),
        );
    }

    fn needs_compensation(state: &LedgerState, entry: &SideEffectEntry) -> bool {
        match entry.status {
            EffectStatus::Compensated => false,
            EffectStatus::Failed => state.was_executed(entry.effect_id),
            EffectStatus::Pending | EffectStatus::Executed => true,
        }
    }

    /// Compensates `effect_ids` newest-first, stopping at the first hard failure.
    async fn compensate_many(&self, mut effect_ids: Vec<Uuid>) -> Result<CompensationReport, EngineError> {
        let _guard = self.compensation_lock.lock().await;
        {
            let state = self.state.read();
            effect_ids.retain(|id| {
                state
                    .latest(*id)
                    .is_some_and(|entry| Self::needs_compensation(&state, entry))
            });
            effect_ids.sort_by_key(|id| std::cmp::Reverse(state.origin.get(id).copied().unwrap_or(0)));
        }

        let mut report = CompensationReport::default();
        for (pos, effect_id) in effect_ids.iter().enumerate() {
            let result = self.compensate_locked(*effect_id).await?;
            if result.halted {
                report.halted_at = Some(*effect_id);
                report.unresolved.extend_from_slice(&effect_ids[pos..]);
                report.results.push(result);
                break;
            }
            if !result.success {
                report.unresolved.push(*effect_id);
            }
            report.results.push(result);
        }
        Ok(report)
    }

    /// Compensates every effect of `node_id`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub async fn compensate_all_for_node(&self, node_id: &str) -> Result<CompensationReport, EngineError> {
        let ids = self.state.read().by_node.get(node_id).cloned().unwrap_or_default();
        self.compensate_many(ids).await
    }

    /// Compensates effects recorded at or after `cursor`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub async fn compensate_since(
        &self,
        cursor: u64,
        run_id: Option<Uuid>,
    ) -> Result<CompensationReport, EngineError> {
        let ids = self.effect_ids_since(cursor, run_id);
        self.compensate_many(ids).await
    }

    fn effect_ids_since(&self, cursor: u64, run_id: Option<Uuid>) -> Vec<Uuid> {
        let state = self.state.read();
        let mut ids: Vec<(u64, Uuid)> = state
            .origin
            .iter()
            .filter(|(_, seq)| **seq >= cursor)
            .filter(|(id, _)| {
                run_id.map_or(true, |run| state.latest(**id).is_some_and(|e| e.run_id == run))
            })
            .map(|(id, &seq)| (seq, *id))
            .collect();
        ids.sort_by_key(|(seq, _)| std::cmp::Reverse(*seq));
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Effects recorded at or after `cursor` that still need compensating,
    /// newest first.
    #[must_use]
    pub fn uncompensated_since(&self, cursor: u64, run_id: Option<Uuid>) -> Vec<SideEffectEntry> {
        let ids = self.effect_ids_since(cursor, run_id);
        let state = self.state.read();
        ids.into_iter()
            .filter_map(|id| state.latest(id))
            .filter(|entry| Self::needs_compensation(&state, entry))
            .cloned()
            .collect()
    }

    /// The seq the next entry will get; effects recorded after this point are
    /// "since" it.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.state.read().next_seq()
    }

    /// Newest state of one effect.
    #[must_use]
    pub fn get(&self, effect_id: Uuid) -> Option<SideEffectEntry> {
        self.state.read().latest(effect_id).cloned()
    }

    /// Current status of one effect.
    #[must_use]
    pub fn current_status(&self, effect_id: Uuid) -> Option<EffectStatus> {
        self.state.read().latest(effect_id).map(|e| e.status)
    }

    /// Every entry for one effect, oldest first.
    #[must_use]
    pub fn history(&self, effect_id: Uuid) -> Vec<SideEffectEntry> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.effect_id == effect_id)
            .cloned()
            .collect()
    }

    /// Newest state of each effect recorded by `node_id`, in recording order.
    #[must_use]
    pub fn entries_for_node(&self, node_id: &str) -> Vec<SideEffectEntry> {
        let state = self.state.read();
        state
            .by_node
            .get(node_id)
            .map(|ids| state.latest_of(ids))
            .unwrap_or_default()
    }

    /// Newest state of each effect recorded in `run_id`, in recording order.
    #[must_use]
    pub fn entries_for_run(&self, run_id: Uuid) -> Vec<SideEffectEntry> {
        let state = self.state.read();
        state
            .by_run
            .get(&run_id)
            .map(|ids| state.latest_of(ids))
            .unwrap_or_default()
    }

    /// Effects waiting on a human, in recording order.
    #[must_use]
    pub fn pending_user_actions(&self) -> Vec<SideEffectEntry> {
        let state = self.state.read();
        let mut pending: Vec<&SideEffectEntry> = state
            .latest
            .values()
            .map(|&idx| &state.entries[idx])
            .filter(|e| e.requires_user_action && e.status != EffectStatus::Compensated)
            .collect();
        pending.sort_by_key(|e| state.origin.get(&e.effect_id).copied().unwrap_or(0));
        pending.into_iter().cloned().collect()
    }

    /// Total number of entries, including transitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if nothing was ever recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use crate::ledger::{FnCompensationHandler, MatchRule, MockCompensationHandler};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ledger_with(registry: CompensationRegistry) -> SideEffectLedger {
        SideEffectLedger::new(
            Arc::new(registry),
            LedgerConfig::default(),
            Arc::new(NoOpEventSink),
        )
    }

    fn reversible(op: &str) -> SideEffect {
        SideEffect::new(op, format!("{op} effect"), CompensationDescriptor::reversible(format!("undo.{op}"), json!({})))
    }

    fn order_tracking_registry(order: Arc<parking_lot::Mutex<Vec<String>>>) -> CompensationRegistry {
        let registry = CompensationRegistry::new();
        registry.register(
            MatchRule::any(),
            Arc::new(FnCompensationHandler::new(move |entry| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(entry.effect.operation.clone());
                    Ok(HandlerOutcome::Compensated(json!("undone")))
                }
            })),
        );
        registry
    }

    #[tokio::test]
    async fn test_node_effects_compensate_newest_first() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let ledger = ledger_with(order_tracking_registry(Arc::clone(&order)));
        let run = Uuid::new_v4();
        for op in ["a", "b", "c"] {
            let id = ledger.append(run, "writer", reversible(op)).unwrap();
            ledger.mark_executed(id, json!({"op": op})).unwrap();
        }

        let report = ledger.compensate_all_for_node("writer").await.unwrap();

        assert_eq!(*order.lock(), vec!["c", "b", "a"]);
        assert!(report.is_complete());
        assert_eq!(report.compensated(), 3);
        assert!(ledger
            .entries_for_node("writer")
            .iter()
            .all(|e| e.status == EffectStatus::Compensated));
    }

    #[tokio::test]
    async fn test_transitions_append_entries() {
        let ledger = ledger_with(CompensationRegistry::new());
        let id = ledger
            .append(Uuid::nil(), "n", SideEffect::new("cache.put", "warm", CompensationDescriptor::Idempotent))
            .unwrap();
        ledger.mark_executed(id, json!(1)).unwrap();
        let result = ledger.compensate(id).await.unwrap();

        assert!(result.success);
        let history = ledger.history(id);
        let statuses: Vec<_> = history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![EffectStatus::Pending, EffectStatus::Executed, EffectStatus::Compensated]
        );
        assert!(history.iter().all(|e| e.effect_id == id));
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.current_status(id), Some(EffectStatus::Compensated));
    }

    #[tokio::test]
    async fn test_invalid_transition() {
        let ledger = ledger_with(CompensationRegistry::new());
        let id = ledger.append(Uuid::nil(), "n", reversible("x")).unwrap();
        ledger.mark_failed(id, "boom").unwrap();
        let err = ledger.mark_executed(id, json!(null)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Compensation(CompensationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ledger.mark_executed(Uuid::new_v4(), json!(null)),
            Err(EngineError::Compensation(CompensationError::UnknownEffect(_)))
        ));
    }

    #[tokio::test]
    async fn test_irreversible_and_unmatched_need_user_action() {
        let ledger = ledger_with(CompensationRegistry::new());
        let mail = ledger
            .append(
                Uuid::nil(),
                "n",
                SideEffect::new(
                    "email.send",
                    "newsletter",
                    CompensationDescriptor::irreversible(["Send a correction email"]),
                ),
            )
            .unwrap();
        ledger.mark_executed(mail, json!({})).unwrap();
        let post = ledger.append(Uuid::nil(), "n", reversible("post")).unwrap();
        ledger.mark_executed(post, json!({})).unwrap();

        let mail_result = ledger.compensate(mail).await.unwrap();
        assert!(!mail_result.success);
        assert!(mail_result.requires_user_action);
        assert_eq!(mail_result.manual_steps, vec!["Send a correction email".to_string()]);

        let post_result = ledger.compensate(post).await.unwrap();
        assert!(post_result.requires_user_action);
        assert!(!post_result.halted);
        assert!(post_result.manual_steps[0].contains("No compensation handler"));

        let pending: Vec<Uuid> = ledger.pending_user_actions().iter().map(|e| e.effect_id).collect();
        assert_eq!(pending, vec![mail, post]);
        assert_eq!(ledger.current_status(mail), Some(EffectStatus::Executed));
    }

    #[tokio::test]
    async fn test_hard_failure_stops_pass() {
        let mut handler = MockCompensationHandler::new();
        handler.expect_compensate().returning(|entry| {
            if entry.effect.operation == "b" {
                Err("service unavailable".into())
            } else {
                Ok(HandlerOutcome::Compensated(json!(true)))
            }
        });
        let registry = CompensationRegistry::new();
        registry.register(MatchRule::any(), Arc::new(handler));
        let ledger = ledger_with(registry);
        let run = Uuid::new_v4();
        let mut ids = Vec::new();
        for op in ["a", "b", "c"] {
            let id = ledger.append(run, "n", reversible(op)).unwrap();
            ledger.mark_executed(id, json!({})).unwrap();
            ids.push(id);
        }

        let report = ledger.compensate_since(0, Some(run)).await.unwrap();

        assert_eq!(report.results.len(), 2);
        assert!(report.results[0].success);
        assert!(report.results[1].halted);
        assert_eq!(report.halted_at, Some(ids[1]));
        assert_eq!(report.unresolved, vec![ids[1], ids[0]]);
        assert_eq!(ledger.current_status(ids[0]), Some(EffectStatus::Executed));
        assert_eq!(ledger.current_status(ids[1]), Some(EffectStatus::Failed));
        assert_eq!(ledger.current_status(ids[2]), Some(EffectStatus::Compensated));
        assert!(ledger.get(ids[1]).unwrap().requires_user_action);
    }

    #[tokio::test]
    async fn test_user_action_is_skipped_not_halting() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let ledger = ledger_with(order_tracking_registry(Arc::clone(&order)));
        let run = Uuid::new_v4();
        let a = ledger.append(run, "n", reversible("a")).unwrap();
        ledger.mark_executed(a, json!({})).unwrap();
        let b = ledger
            .append(run, "n", SideEffect::new("sms", "text", CompensationDescriptor::irreversible(["Apologize"])))
            .unwrap();
        ledger.mark_executed(b, json!({})).unwrap();

        let report = ledger.compensate_since(0, Some(run)).await.unwrap();

        assert_eq!(report.halted_at, None);
        assert_eq!(report.unresolved, vec![b]);
        assert_eq!(*order.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_failed_and_pending_effects() {
        let ledger = ledger_with(CompensationRegistry::new());
        let failed = ledger.append(Uuid::nil(), "n", reversible("x")).unwrap();
        ledger.mark_failed(failed, "rejected").unwrap();
        let pending = ledger.append(Uuid::nil(), "n", reversible("y")).unwrap();

        let failed_result = ledger.compensate(failed).await.unwrap();
        assert!(failed_result.success);

        let pending_result = ledger.compensate(pending).await.unwrap();
        assert!(pending_result.requires_user_action);
        assert_eq!(ledger.current_status(pending), Some(EffectStatus::Pending));

        let remaining: Vec<Uuid> = ledger
            .uncompensated_since(0, None)
            .iter()
            .map(|e| e.effect_id)
            .collect();
        assert_eq!(remaining, vec![pending]);
    }

    #[tokio::test]
    async fn test_failure_after_execution_still_compensates() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let ledger = ledger_with(order_tracking_registry(Arc::clone(&order)));
        for op in ["a", "b", "c"] {
            let id = ledger.append(Uuid::nil(), "n", reversible(op)).unwrap();
            ledger.mark_executed(id, json!({})).unwrap();
        }
        let late = ledger.append(Uuid::nil(), "n", reversible("late")).unwrap();
        ledger.mark_executed(late, json!({})).unwrap();
        ledger.mark_failed(late, "post-commit check failed").unwrap();

        let result = ledger.compensate(late).await.unwrap();

        assert!(result.success);
        assert_eq!(*order.lock(), vec!["late"]);
        assert_eq!(ledger.current_status(late), Some(EffectStatus::Compensated));
    }

    #[tokio::test]
    async fn test_handler_timeout_is_hard_failure() {
        let registry = CompensationRegistry::new();
        registry.register(
            MatchRule::any(),
            Arc::new(FnCompensationHandler::new(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(HandlerOutcome::Compensated(json!(null)))
            })),
        );
        let config = LedgerConfig {
            compensation_timeout_ms: 20,
            ..LedgerConfig::default()
        };
        let events = Arc::new(CollectingEventSink::new());
        let ledger = SideEffectLedger::new(Arc::new(registry), config, events.clone());
        let id = ledger.append(Uuid::nil(), "n", reversible("slow")).unwrap();
        ledger.mark_executed(id, json!({})).unwrap();

        let result = ledger.compensate(id).await.unwrap();

        assert!(result.halted);
        assert!(result.message.contains("timed out"));
        assert_eq!(events.events_of_type(names::COMPENSATION_FAILED).len(), 1);
        assert_eq!(events.events_of_type(names::EFFECT_RECORDED).len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_scopes_compensation() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let ledger = ledger_with(order_tracking_registry(Arc::clone(&order)));
        let run = Uuid::new_v4();
        let before = ledger.append(run, "n", reversible("before")).unwrap();
        ledger.mark_executed(before, json!({})).unwrap();
        let cursor = ledger.cursor();
        let after = ledger.append(run, "m", reversible("after")).unwrap();
        ledger.mark_executed(after, json!({})).unwrap();

        let report = ledger.compensate_since(cursor, Some(run)).await.unwrap();

        assert_eq!(report.compensated(), 1);
        assert_eq!(*order.lock(), vec!["after"]);
        assert_eq!(ledger.current_status(before), Some(EffectStatus::Executed));
    }

    #[tokio::test]
    async fn test_journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let run = Uuid::new_v4();
        let id = {
            let ledger = SideEffectLedger::open(
                &path,
                Arc::new(CompensationRegistry::new()),
                LedgerConfig::default(),
                Arc::new(NoOpEventSink),
            )
            .unwrap();
            let id = ledger.append(run, "n", reversible("persisted")).unwrap();
            ledger.mark_executed(id, json!({"ok": true})).unwrap();
            id
        };

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let reopened = SideEffectLedger::open(
            &path,
            Arc::new(order_tracking_registry(Arc::clone(&order))),
            LedgerConfig::default(),
            Arc::new(NoOpEventSink),
        )
        .unwrap();

        assert_eq!(reopened.entries_for_run(run).len(), 1);
        assert_eq!(reopened.cursor(), 2);
        let report = reopened.compensate_since(0, Some(run)).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(*order.lock(), vec!["persisted"]);
        assert_eq!(reopened.history(id).len(), 3);
    }

    #[test]
    fn test_concurrent_writers_keep_journal_in_seq_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = Arc::new(
            SideEffectLedger::open(
                &path,
                Arc::new(CompensationRegistry::new()),
                LedgerConfig::default(),
                Arc::new(NoOpEventSink),
            )
            .unwrap(),
        );

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = ledger
                            .append(Uuid::nil(), format!("w{w}"), reversible(&format!("op{i}")))
                            .unwrap();
                        ledger.mark_executed(id, json!({})).unwrap();
                        assert!(ledger.cursor() > 0);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(ledger.cursor(), 200);

        let (_, entries) = LedgerJournal::open(&path).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..200).collect::<Vec<_>>());
        let reopened = SideEffectLedger::open(
            &path,
            Arc::new(CompensationRegistry::new()),
            LedgerConfig::default(),
            Arc::new(NoOpEventSink),
        )
        .unwrap();
        assert_eq!(reopened.entries_for_node("w3").len(), 25);
        assert!(reopened
            .entries_for_node("w0")
            .iter()
            .all(|e| e.status == EffectStatus::Executed));
    }
}
