//! Agent invocation port.

use crate::cancellation::CancellationToken;
use crate::graph::Node;
use crate::ledger::EffectRecorder;
use crate::streaming::{AgentHints, ChunkStream, StreamReader};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Why an agent is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPurpose {
    /// Normal scheduled execution.
    Execute,
    /// Recreating a checkpointed stream.
    Regenerate,
}

/// Per-invocation context handed to an agent.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Current run.
    pub run_id: Uuid,
    /// Node being executed.
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Why the agent is invoked.
    pub purpose: InvocationPurpose,
    /// Run-scoped cancellation.
    pub cancel: CancellationToken,
    /// Records externally visible operations against this run and node.
    /// Absent during regeneration, which must not repeat side effects.
    pub effects: Option<EffectRecorder>,
}

/// One resolved input.
#[derive(Debug)]
pub enum InputValue {
    /// A complete value.
    Value(Value),
    /// An upstream stream.
    Stream(StreamReader),
}

impl InputValue {
    /// The value, if this input is not streamed.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Stream(_) => None,
        }
    }

    /// Returns true if the input is streamed.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Resolves the input to a value, draining a stream into an array.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream faults.
    pub async fn into_value(self) -> Result<Value, AgentError> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Stream(reader) => reader
                .collect_value()
                .await
                .map_err(|fault| AgentError::retryable(fault.message)),
        }
    }
}

/// Resolved inputs for one invocation, keyed by slot.
#[derive(Debug, Default)]
pub struct AgentInputs {
    slots: HashMap<String, InputValue>,
}

impl AgentInputs {
    /// Creates empty inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds inputs from complete values.
    #[must_use]
    pub fn from_values(values: HashMap<String, Value>) -> Self {
        Self {
            slots: values
                .into_iter()
                .map(|(k, v)| (k, InputValue::Value(v)))
                .collect(),
        }
    }

    /// Sets a slot.
    pub fn insert(&mut self, slot: impl Into<String>, value: InputValue) {
        self.slots.insert(slot.into(), value);
    }

    /// A value input.
    #[must_use]
    pub fn value(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot).and_then(InputValue::as_value)
    }

    /// Takes a slot out, for consuming a stream.
    pub fn take(&mut self, slot: &str) -> Option<InputValue> {
        self.slots.remove(slot)
    }

    /// Slot names.
    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if there are no inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true if any slot is streamed.
    #[must_use]
    pub fn has_stream(&self) -> bool {
        self.slots.values().any(InputValue::is_stream)
    }

    /// Resolves every slot to a value, draining streams.
    ///
    /// # Errors
    ///
    /// Returns an error if any stream faults.
    pub async fn into_values(self) -> Result<HashMap<String, Value>, AgentError> {
        let mut out = HashMap::with_capacity(self.slots.len());
        for (slot, input) in self.slots {
            out.insert(slot, input.into_value().await?);
        }
        Ok(out)
    }
}

/// What an agent produced.
pub enum AgentOutput {
    /// A complete value.
    Value(Value),
    /// Incremental chunks.
    Stream(ChunkStream),
}

impl std::fmt::Debug for AgentOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An agent's failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AgentError {
    /// What went wrong.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl AgentError {
    /// A failure that may succeed on retry.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not succeed on retry.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Invokes agents for node execution and stream regeneration.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Runs `node` against `inputs`.
    async fn invoke(
        &self,
        node: &Node,
        inputs: AgentInputs,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError>;

    /// Hints about an agent type, consulted by strategy selection.
    fn hints(&self, _agent_type: &str) -> AgentHints {
        AgentHints::default()
    }
}
