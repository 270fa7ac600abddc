//! Mock agents for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::graph::Node;
use crate::ledger::SideEffect;
use crate::ports::{AgentError, AgentInputs, AgentInvoker, AgentOutput, InvocationContext, InvocationPurpose};
use crate::streaming::{AgentHints, StreamFault};

/// One call seen by a mock agent.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Node invoked.
    pub node_id: String,
    /// Attempt number from the context.
    pub attempt: u32,
    /// Execution or regeneration.
    pub purpose: InvocationPurpose,
    /// Inputs, with streams drained.
    pub inputs: HashMap<String, Value>,
}

/// Answers with a scripted value per node, or with
/// `{"node": id, "inputs": {...}}` when nothing is scripted.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    responses: HashMap<String, Value>,
    effects: HashMap<String, Vec<SideEffect>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedAgent {
    /// Creates an agent with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the output of `node_id`.
    #[must_use]
    pub fn respond(mut self, node_id: impl Into<String>, value: Value) -> Self {
        self.responses.insert(node_id.into(), value);
        self
    }

    /// Records `effects` against the ledger, in order, whenever `node_id`
    /// executes.
    #[must_use]
    pub fn with_effects(mut self, node_id: impl Into<String>, effects: Vec<SideEffect>) -> Self {
        self.effects.insert(node_id.into(), effects);
        self
    }

    /// Every call so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Calls made for one node.
    #[must_use]
    pub fn invocations_of(&self, node_id: &str) -> Vec<Invocation> {
        self.invocations
            .lock()
            .iter()
            .filter(|call| call.node_id == node_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(
        &self,
        node: &Node,
        inputs: AgentInputs,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        let inputs = inputs.into_values().await?;
        self.invocations.lock().push(Invocation {
            node_id: node.id.clone(),
            attempt: ctx.attempt,
            purpose: ctx.purpose,
            inputs: inputs.clone(),
        });

        if let (Some(effects), Some(recorder)) = (self.effects.get(&node.id), ctx.effects.as_ref()) {
            for effect in effects {
                let id = recorder
                    .record(effect.clone())
                    .map_err(|e| AgentError::fatal(e.to_string()))?;
                recorder
                    .executed(id, json!({"ok": true}))
                    .map_err(|e| AgentError::fatal(e.to_string()))?;
            }
        }

        let output = self
            .responses
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| json!({"node": node.id, "inputs": inputs}));
        Ok(AgentOutput::Value(output))
    }
}

#[derive(Debug, Clone)]
struct FailureScript {
    message: String,
    retryable: bool,
    times: Option<u32>,
}

/// Fails selected nodes and delegates everything else.
pub struct FailingAgent {
    inner: Arc<dyn AgentInvoker>,
    scripts: HashMap<String, FailureScript>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl std::fmt::Debug for FailingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingAgent")
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

impl FailingAgent {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn AgentInvoker>) -> Self {
        Self {
            inner,
            scripts: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// `node_id` always fails, non-retryably.
    #[must_use]
    pub fn fail(mut self, node_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.scripts.insert(
            node_id.into(),
            FailureScript {
                message: message.into(),
                retryable: false,
                times: None,
            },
        );
        self
    }

    /// `node_id` fails retryably on its first `times` calls, then delegates.
    #[must_use]
    pub fn fail_times(mut self, node_id: impl Into<String>, times: u32) -> Self {
        self.scripts.insert(
            node_id.into(),
            FailureScript {
                message: "transient failure".to_string(),
                retryable: true,
                times: Some(times),
            },
        );
        self
    }

    /// Calls seen for `node_id`, failed ones included.
    #[must_use]
    pub fn attempts(&self, node_id: &str) -> u32 {
        self.attempts.lock().get(node_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AgentInvoker for FailingAgent {
    async fn invoke(
        &self,
        node: &Node,
        inputs: AgentInputs,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        let calls = {
            let mut attempts = self.attempts.lock();
            let calls = attempts.entry(node.id.clone()).or_insert(0);
            *calls += 1;
            *calls
        };
        if let Some(script) = self.scripts.get(&node.id) {
            if script.times.map_or(true, |times| calls <= times) {
                return Err(AgentError {
                    message: script.message.clone(),
                    retryable: script.retryable,
                });
            }
        }
        self.inner.invoke(node, inputs, ctx).await
    }

    fn hints(&self, agent_type: &str) -> AgentHints {
        self.inner.hints(agent_type)
    }
}

/// Sleeps before delegating. Cancellation interrupts the sleep.
pub struct SlowAgent {
    inner: Arc<dyn AgentInvoker>,
    delay: Duration,
    per_node: HashMap<String, Duration>,
}

impl std::fmt::Debug for SlowAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlowAgent")
            .field("delay", &self.delay)
            .field("per_node", &self.per_node)
            .finish_non_exhaustive()
    }
}

impl SlowAgent {
    /// Delays every node by `delay`.
    #[must_use]
    pub fn new(inner: Arc<dyn AgentInvoker>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            per_node: HashMap::new(),
        }
    }

    /// Overrides the delay of one node.
    #[must_use]
    pub fn with_node_delay(mut self, node_id: impl Into<String>, delay: Duration) -> Self {
        self.per_node.insert(node_id.into(), delay);
        self
    }
}

#[async_trait]
impl AgentInvoker for SlowAgent {
    async fn invoke(
        &self,
        node: &Node,
        inputs: AgentInputs,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        let delay = self.per_node.get(&node.id).copied().unwrap_or(self.delay);
        tokio::select! {
            () = ctx.cancel.cancelled() => Err(AgentError::fatal("cancelled while sleeping")),
            () = tokio::time::sleep(delay) => self.inner.invoke(node, inputs, ctx).await,
        }
    }

    fn hints(&self, agent_type: &str) -> AgentHints {
        self.inner.hints(agent_type)
    }
}

/// Emits `{"node": id, "seq": i}` chunks after draining its inputs.
/// Output is deterministic, so regeneration reproduces it.
#[derive(Debug, Clone)]
pub struct StreamingAgent {
    chunks: usize,
    fault_after: Option<usize>,
}

impl StreamingAgent {
    /// An agent streaming `chunks` chunks per call.
    #[must_use]
    pub fn new(chunks: usize) -> Self {
        Self {
            chunks,
            fault_after: None,
        }
    }

    /// Faults the stream after `chunks` chunks.
    #[must_use]
    pub fn with_fault_after(mut self, chunks: usize) -> Self {
        self.fault_after = Some(chunks);
        self
    }

    /// The chunks one call produces for `node_id`.
    #[must_use]
    pub fn expected_chunks(&self, node_id: &str) -> Vec<Value> {
        (0..self.chunks)
            .map(|seq| json!({"node": node_id, "seq": seq}))
            .collect()
    }
}

#[async_trait]
impl AgentInvoker for StreamingAgent {
    async fn invoke(
        &self,
        node: &Node,
        inputs: AgentInputs,
        _ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        inputs.into_values().await?;

        let chunks = self.expected_chunks(&node.id);
        let fault_after = self.fault_after;
        let stream = futures::stream::unfold(0usize, move |seq| {
            let chunk = chunks.get(seq).cloned();
            async move {
                if fault_after == Some(seq) {
                    return Some((Err(StreamFault::new("producer fault")), usize::MAX));
                }
                chunk.map(|chunk| (Ok(chunk), seq + 1))
            }
        });
        Ok(AgentOutput::Stream(Box::pin(stream)))
    }
}

/// Start and finish of one call.
#[derive(Debug, Clone, Copy)]
pub struct CallSpan {
    /// When the agent was entered.
    pub started: Instant,
    /// When the agent returned.
    pub finished: Instant,
}

/// Records when each node's agent call starts and finishes.
pub struct RecordingAgent {
    inner: Arc<dyn AgentInvoker>,
    spans: Mutex<Vec<(String, CallSpan)>>,
}

impl std::fmt::Debug for RecordingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingAgent")
            .field("calls", &self.spans.lock().len())
            .finish_non_exhaustive()
    }
}

impl RecordingAgent {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn AgentInvoker>) -> Self {
        Self {
            inner,
            spans: Mutex::new(Vec::new()),
        }
    }

    /// Every recorded call, in finish order.
    #[must_use]
    pub fn spans(&self) -> Vec<(String, CallSpan)> {
        self.spans.lock().clone()
    }

    /// The last call for `node_id`.
    #[must_use]
    pub fn span(&self, node_id: &str) -> Option<CallSpan> {
        self.spans
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == node_id)
            .map(|(_, span)| *span)
    }
}

#[async_trait]
impl AgentInvoker for RecordingAgent {
    async fn invoke(
        &self,
        node: &Node,
        inputs: AgentInputs,
        ctx: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        let started = Instant::now();
        let result = self.inner.invoke(node, inputs, ctx).await;
        self.spans.lock().push((
            node.id.clone(),
            CallSpan {
                started,
                finished: Instant::now(),
            },
        ));
        result
    }

    fn hints(&self, agent_type: &str) -> AgentHints {
        self.inner.hints(agent_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn ctx(node_id: &str) -> InvocationContext {
        InvocationContext {
            run_id: Uuid::nil(),
            node_id: node_id.to_string(),
            attempt: 1,
            purpose: InvocationPurpose::Execute,
            cancel: CancellationToken::new(),
            effects: None,
        }
    }

    #[tokio::test]
    async fn test_failing_agent_recovers_after_scripted_failures() {
        let agent = FailingAgent::new(Arc::new(ScriptedAgent::new())).fail_times("n", 2);
        let node = Node::new("n", "echo");

        for _ in 0..2 {
            let err = agent.invoke(&node, AgentInputs::new(), ctx("n")).await.unwrap_err();
            assert!(err.retryable);
        }
        assert!(agent.invoke(&node, AgentInputs::new(), ctx("n")).await.is_ok());
        assert_eq!(agent.attempts("n"), 3);
    }

    #[tokio::test]
    async fn test_streaming_agent_faults_where_told() {
        let agent = StreamingAgent::new(5).with_fault_after(2);
        let node = Node::new("s", "stream");
        let AgentOutput::Stream(stream) = agent.invoke(&node, AgentInputs::new(), ctx("s")).await.unwrap() else {
            panic!("expected a stream");
        };

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }
}
