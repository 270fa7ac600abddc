//! Side-effect ledger entries.

use crate::utils::{generate_id, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// How an effect can be undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationDescriptor {
    /// A declared reverse operation undoes the effect.
    Reversible {
        /// Name of the reverse operation.
        reverse_op: String,
        /// Arguments for the reverse operation.
        #[serde(default)]
        params: Value,
    },
    /// Repeating or ignoring the effect is harmless.
    Idempotent,
    /// Only a human can undo the effect.
    Irreversible {
        /// Steps for the human.
        manual_steps: Vec<String>,
    },
    /// A compensating call mitigates the effect eventually.
    Eventual {
        /// Name of the compensating call.
        compensating_call: String,
        /// Arguments for the call.
        #[serde(default)]
        params: Value,
    },
}

impl CompensationDescriptor {
    /// A reversible effect.
    #[must_use]
    pub fn reversible(reverse_op: impl Into<String>, params: Value) -> Self {
        Self::Reversible {
            reverse_op: reverse_op.into(),
            params,
        }
    }

    /// An irreversible effect.
    #[must_use]
    pub fn irreversible<I, S>(manual_steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Irreversible {
            manual_steps: manual_steps.into_iter().map(Into::into).collect(),
        }
    }

    /// An eventually compensated effect.
    #[must_use]
    pub fn eventual(compensating_call: impl Into<String>, params: Value) -> Self {
        Self::Eventual {
            compensating_call: compensating_call.into(),
            params,
        }
    }

    /// The descriptor kind as a string.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reversible { .. } => "reversible",
            Self::Idempotent => "idempotent",
            Self::Irreversible { .. } => "irreversible",
            Self::Eventual { .. } => "eventual",
        }
    }
}

/// Status of an effect. Moves `pending -> executed -> compensated | failed`;
/// a pending effect whose operation failed moves straight to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectStatus {
    /// Recorded before the operation ran.
    Pending,
    /// The operation completed.
    Executed,
    /// The effect was undone.
    Compensated,
    /// The operation or its compensation failed.
    Failed,
}

impl fmt::Display for EffectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executed => write!(f, "executed"),
            Self::Compensated => write!(f, "compensated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl EffectStatus {
    /// Whether a transition to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Executed | Self::Failed)
                | (Self::Executed, Self::Compensated | Self::Failed | Self::Executed)
                | (Self::Failed, Self::Compensated | Self::Failed)
        )
    }
}

/// An externally visible operation about to be performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    /// Operation kind, e.g. `email.send`.
    pub operation: String,
    /// Human-readable description.
    pub description: String,
    /// External service, if any.
    #[serde(default)]
    pub service: Option<String>,
    /// How to undo it.
    pub compensation: CompensationDescriptor,
    /// Operation payload, kept for compensation handlers.
    #[serde(default)]
    pub payload: Value,
}

impl SideEffect {
    /// Creates an effect description.
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        description: impl Into<String>,
        compensation: CompensationDescriptor,
    ) -> Self {
        Self {
            operation: operation.into(),
            description: description.into(),
            service: None,
            compensation,
            payload: Value::Null,
        }
    }

    /// Sets the service name.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// One immutable ledger line.
///
/// The first entry of an effect has `entry_id == effect_id`; every status
/// change appends a new entry with the same `effect_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffectEntry {
    /// Position in the ledger.
    pub seq: u64,
    /// This entry's id.
    pub entry_id: Uuid,
    /// The effect this entry belongs to.
    pub effect_id: Uuid,
    /// Node that caused the effect.
    pub node_id: String,
    /// Run that caused the effect.
    pub run_id: Uuid,
    /// When the entry was appended.
    pub timestamp: Timestamp,
    /// The effect.
    pub effect: SideEffect,
    /// Status after this entry.
    pub status: EffectStatus,
    /// Operation or compensation result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message for failed entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A human must act on this effect.
    #[serde(default)]
    pub requires_user_action: bool,
    /// Steps for the human.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual_steps: Vec<String>,
}

impl SideEffectEntry {
    pub(crate) fn first(seq: u64, run_id: Uuid, node_id: String, effect: SideEffect) -> Self {
        let id = generate_id();
        Self {
            seq,
            entry_id: id,
            effect_id: id,
            node_id,
            run_id,
            timestamp: now_utc(),
            effect,
            status: EffectStatus::Pending,
            result: None,
            error: None,
            requires_user_action: false,
            manual_steps: Vec::new(),
        }
    }

    pub(crate) fn transition(&self, seq: u64, status: EffectStatus) -> Self {
        Self {
            seq,
            entry_id: generate_id(),
            timestamp: now_utc(),
            status,
            result: None,
            error: None,
            requires_user_action: false,
            manual_steps: Vec::new(),
            ..self.clone()
        }
    }
}

/// Outcome of compensating one effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationResult {
    /// The effect.
    pub effect_id: Uuid,
    /// The effect is undone (or needed no undoing).
    pub success: bool,
    /// A human must act.
    pub requires_user_action: bool,
    /// Steps for the human.
    #[serde(default)]
    pub manual_steps: Vec<String>,
    /// What happened.
    pub message: String,
    /// The compensation itself failed; a multi-effect pass stops here.
    #[serde(default)]
    pub halted: bool,
}

impl CompensationResult {
    pub(crate) fn done(effect_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            effect_id,
            success: true,
            requires_user_action: false,
            manual_steps: Vec::new(),
            message: message.into(),
            halted: false,
        }
    }

    pub(crate) fn user_action(effect_id: Uuid, steps: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            effect_id,
            success: false,
            requires_user_action: true,
            manual_steps: steps,
            message: message.into(),
            halted: false,
        }
    }

    pub(crate) fn failed(effect_id: Uuid, steps: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            effect_id,
            success: false,
            requires_user_action: true,
            manual_steps: steps,
            message: message.into(),
            halted: true,
        }
    }
}

/// Outcome of compensating several effects newest-first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompensationReport {
    /// Per-effect results, in the order attempted.
    pub results: Vec<CompensationResult>,
    /// The effect whose failure stopped the pass.
    #[serde(default)]
    pub halted_at: Option<Uuid>,
    /// Effects still not compensated: the halting one, user-action ones and
    /// everything not attempted.
    #[serde(default)]
    pub unresolved: Vec<Uuid>,
}

impl CompensationReport {
    /// Whether every effect was compensated.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Number of effects compensated.
    #[must_use]
    pub fn compensated(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }
}
