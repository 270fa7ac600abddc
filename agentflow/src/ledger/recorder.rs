//! Effect recording handle passed to agents.

use super::entry::SideEffect;
use super::store::SideEffectLedger;
use crate::errors::EngineError;
use crate::ports::AgentError;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Appends effects to the ledger under one run and node.
#[derive(Clone)]
pub struct EffectRecorder {
    ledger: Arc<SideEffectLedger>,
    run_id: Uuid,
    node_id: String,
}

impl fmt::Debug for EffectRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectRecorder")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl EffectRecorder {
    /// Creates a recorder scoped to `run_id` and `node_id`.
    #[must_use]
    pub fn new(ledger: Arc<SideEffectLedger>, run_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            ledger,
            run_id,
            node_id: node_id.into(),
        }
    }

    /// The run this recorder writes under.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The node this recorder writes under.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Records an effect about to be performed.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger journal write fails.
    pub fn record(&self, effect: SideEffect) -> Result<Uuid, EngineError> {
        self.ledger.append(self.run_id, self.node_id.clone(), effect)
    }

    /// Marks a recorded effect as performed.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown effects or disallowed transitions.
    pub fn executed(&self, effect_id: Uuid, result: Value) -> Result<(), EngineError> {
        self.ledger.mark_executed(effect_id, result)
    }

    /// Marks a recorded operation as failed.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown effects or disallowed transitions.
    pub fn failed(&self, effect_id: Uuid, error: impl Into<String>) -> Result<(), EngineError> {
        self.ledger.mark_failed(effect_id, error)
    }

    /// Records `effect`, awaits `operation`, and marks the outcome.
    ///
    /// Operation errors come back as retryable agent errors; ledger errors
    /// as fatal ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation or the ledger write fails.
    pub async fn perform<T, E, Fut>(&self, effect: SideEffect, operation: Fut) -> Result<T, AgentError>
    where
        T: Serialize,
        E: fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let effect_id = self.record(effect).map_err(ledger_failure)?;
        match operation.await {
            Ok(value) => {
                let recorded = serde_json::to_value(&value).unwrap_or(Value::Null);
                self.executed(effect_id, recorded).map_err(ledger_failure)?;
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                self.failed(effect_id, message.clone()).map_err(ledger_failure)?;
                Err(AgentError::retryable(message))
            }
        }
    }
}

fn ledger_failure(e: EngineError) -> AgentError {
    AgentError::fatal(format!("Ledger write failed: {e}"))
}
