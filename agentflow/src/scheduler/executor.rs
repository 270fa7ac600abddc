//! Running one node: slot acquisition, attempts, timeouts and output
//! delivery.

use super::inputs::{json_size, ResolvedInputs};
use super::retry::{RetryConfig, RetryDecision, RetryState};
use super::state::NodeOutput;
use crate::cancellation::CancellationToken;
use crate::core::ArtifactReference;
use crate::errors::{EngineError, ResourceError};
use crate::events::{names, EngineEvent, EventSink};
use crate::graph::Node;
use crate::ledger::{EffectRecorder, SideEffectLedger};
use crate::ports::{
    put_json, AgentInvoker, AgentOutput, ArtifactStore, InvocationContext, InvocationPurpose,
    StoreHints,
};
use crate::streaming::{ChunkStream, StreamLifecycleManager, StreamProducer, StreamingStrategy};
use crate::utils::{now_utc, Timestamp};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

/// Run-wide collaborators shared by every node task.
pub(crate) struct NodeRuntime {
    pub run_id: Uuid,
    pub invoker: Arc<dyn AgentInvoker>,
    pub store: Arc<dyn ArtifactStore>,
    pub streams: Arc<StreamLifecycleManager>,
    pub ledger: Arc<SideEffectLedger>,
    pub events: Arc<dyn EventSink>,
    pub pool: Arc<Semaphore>,
    pub token: CancellationToken,
    pub default_timeout: Duration,
    pub run_retry: Option<RetryConfig>,
    pub inline_limit_bytes: u64,
}

/// A node ready to run.
#[derive(Debug)]
pub(crate) struct NodeJob {
    pub node: Node,
    pub level: usize,
    pub strategy: StreamingStrategy,
    pub fan_out: usize,
    pub inputs: ResolvedInputs,
}

/// A delivered output.
#[derive(Debug, Clone)]
pub(crate) struct Delivered {
    pub output: NodeOutput,
    pub binding: Value,
    pub output_bytes: u64,
}

/// What a node task reports back to the scheduler.
#[derive(Debug)]
pub(crate) struct NodeCompletion {
    pub node_id: String,
    pub agent_type: String,
    pub level: usize,
    pub strategy: StreamingStrategy,
    pub fan_out: usize,
    pub started_at: Option<Timestamp>,
    pub finished_at: Timestamp,
    pub attempts: u32,
    pub attempt_ms: u64,
    pub input_snapshot: HashMap<String, Value>,
    pub input_bytes: u64,
    pub outcome: Result<Delivered, EngineError>,
}

fn cancelled(token: &CancellationToken) -> EngineError {
    EngineError::Cancelled(token.reason().unwrap_or_else(|| "run cancelled".to_string()))
}

/// Runs `job` to a terminal outcome.
pub(crate) async fn execute_node(rt: Arc<NodeRuntime>, mut job: NodeJob) -> NodeCompletion {
    let mut completion = NodeCompletion {
        node_id: job.node.id.clone(),
        agent_type: job.node.config.agent_type.clone(),
        level: job.level,
        strategy: job.strategy,
        fan_out: job.fan_out,
        started_at: None,
        finished_at: now_utc(),
        attempts: 0,
        attempt_ms: 0,
        input_snapshot: job.inputs.snapshot.clone(),
        input_bytes: job.inputs.bytes,
        outcome: Err(cancelled(&rt.token)),
    };

    let permit = tokio::select! {
        biased;
        () = rt.token.cancelled() => Err(cancelled(&rt.token)),
        permit = Arc::clone(&rt.pool).acquire_owned() => {
            permit.map_err(|_| EngineError::from(ResourceError::PoolClosed))
        }
    };

    match permit {
        Ok(_permit) => {
            completion.started_at = Some(now_utc());
            rt.events.try_emit(
                EngineEvent::new(names::NODE_STARTED)
                    .with_run(rt.run_id)
                    .with_node(job.node.id.clone())
                    .with_data(json!({"level": job.level, "strategy": job.strategy})),
            );
            run_attempts(&rt, &mut job, &mut completion).await;
        }
        Err(err) => completion.outcome = Err(err),
    }

    for (stream_id, index) in std::mem::take(&mut job.inputs.consumed) {
        if let Err(e) = rt.streams.release_consumer(stream_id, index).await {
            warn!(%stream_id, node_id = %job.node.id, error = %e, "Failed to release stream consumer");
        }
    }
    completion.finished_at = now_utc();
    completion
}

async fn run_attempts(rt: &NodeRuntime, job: &mut NodeJob, completion: &mut NodeCompletion) {
    let retry = job
        .node
        .config
        .retry
        .clone()
        .or_else(|| rt.run_retry.clone())
        .unwrap_or_else(RetryConfig::no_retry);
    let timeout = job
        .node
        .config
        .timeout_ms
        .map_or(rt.default_timeout, Duration::from_millis);
    // Streamed inputs cannot be read twice.
    let single_shot = job.inputs.has_streams();
    let mut state = RetryState::new();

    loop {
        let attempt = state.begin_attempt();
        completion.attempts = attempt;
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            () = rt.token.cancelled() => Err(cancelled(&rt.token)),
            timed = tokio::time::timeout(timeout, run_once(rt, job, attempt)) => match timed {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    node_id: job.node.id.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            },
        };

        let err = match result {
            Ok(delivered) => {
                completion.attempt_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                completion.outcome = Ok(delivered);
                return;
            }
            Err(err @ EngineError::Cancelled(_)) => {
                completion.outcome = Err(err);
                return;
            }
            Err(err) => err,
        };

        match state.decide(&retry, err.is_retryable() && !single_shot) {
            RetryDecision::Retry(delay) => {
                warn!(
                    run_id = %rt.run_id,
                    node_id = %job.node.id,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Node attempt failed, retrying"
                );
                rt.events.try_emit(
                    EngineEvent::warning(names::NODE_RETRYING)
                        .with_run(rt.run_id)
                        .with_node(job.node.id.clone())
                        .with_data(json!({
                            "attempt": attempt,
                            "delay_ms": delay.as_millis(),
                            "error": err.to_string(),
                        })),
                );
                tokio::select! {
                    biased;
                    () = rt.token.cancelled() => {
                        completion.outcome = Err(cancelled(&rt.token));
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                completion.outcome = Err(err);
                return;
            }
        }
    }
}

async fn run_once(rt: &NodeRuntime, job: &mut NodeJob, attempt: u32) -> Result<Delivered, EngineError> {
    let node_id = job.node.id.clone();
    let inputs = if attempt == 1 {
        job.inputs
            .take()
            .await
            .map_err(|e| EngineError::node(&node_id, e.message, e.retryable))?
    } else {
        job.inputs.replay()
    };

    let ctx = InvocationContext {
        run_id: rt.run_id,
        node_id: node_id.clone(),
        attempt,
        purpose: InvocationPurpose::Execute,
        cancel: rt.token.clone(),
        effects: Some(EffectRecorder::new(Arc::clone(&rt.ledger), rt.run_id, node_id.clone())),
    };
    debug!(run_id = %rt.run_id, node_id = %node_id, attempt, "Invoking agent");
    let output = rt
        .invoker
        .invoke(&job.node, inputs, ctx)
        .await
        .map_err(|e| EngineError::node(&node_id, e.message, e.retryable))?;
    let plan = Delivery {
        node: &job.node,
        strategy: job.strategy,
        fan_out: job.fan_out,
        input_snapshot: &job.inputs.snapshot,
    };
    deliver(rt, plan, output).await
}

/// The parts of a job that delivery needs. `NodeJob` itself holds a
/// non-`Sync` input stream, so it is never borrowed across an await.
struct Delivery<'a> {
    node: &'a Node,
    strategy: StreamingStrategy,
    fan_out: usize,
    input_snapshot: &'a HashMap<String, Value>,
}

async fn deliver(rt: &NodeRuntime, job: Delivery<'_>, output: AgentOutput) -> Result<Delivered, EngineError> {
    let stream = match output {
        AgentOutput::Value(value) => return store_value(rt, &job.node.id, value).await,
        AgentOutput::Stream(stream) => stream,
    };
    if !job.strategy.is_streaming() {
        let value = drain(stream, &job.node.id).await?;
        return store_value(rt, &job.node.id, value).await;
    }

    let producer = StreamProducer {
        run_id: rt.run_id,
        node: job.node.clone(),
        inputs: job.input_snapshot.clone(),
        strategy: job.strategy,
    };

    if job.fan_out == 0 {
        let handle = rt.streams.register(producer, stream, 1)?;
        let stream_id = handle.stream_id;
        let reader = rt.streams.acquire_reader(stream_id, 0).await?;
        let chunks = match reader.collect_chunks().await {
            Ok(chunks) => chunks,
            Err(fault) => {
                rt.streams.discard(stream_id);
                return Err(EngineError::node(&job.node.id, fault.message, true));
            }
        };
        rt.streams.release_consumer(stream_id, 0).await?;
        return store_value(rt, &job.node.id, Value::Array(chunks)).await;
    }

    let handle = rt.streams.register(producer, stream, job.fan_out)?;
    let output_bytes = if job.strategy == StreamingStrategy::StreamMaterialize {
        rt.streams.materialize(handle.stream_id).await?.bytes
    } else {
        0
    };
    Ok(Delivered {
        output: NodeOutput::Stream {
            stream_id: handle.stream_id,
        },
        binding: json!({"$stream": handle.stream_id}),
        output_bytes,
    })
}

async fn drain(mut stream: ChunkStream, node_id: &str) -> Result<Value, EngineError> {
    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        chunks.push(item.map_err(|fault| EngineError::node(node_id, fault.message, true))?);
    }
    Ok(Value::Array(chunks))
}

async fn store_value(rt: &NodeRuntime, node_id: &str, value: Value) -> Result<Delivered, EngineError> {
    let bytes = json_size(&value);
    if bytes <= rt.inline_limit_bytes {
        return Ok(Delivered {
            output: NodeOutput::Inline {
                value: value.clone(),
            },
            binding: value,
            output_bytes: bytes,
        });
    }

    let reference = ArtifactReference::for_node_output(&rt.run_id, node_id);
    put_json(rt.store.as_ref(), &reference.key, &value, StoreHints::default()).await?;
    debug!(run_id = %rt.run_id, node_id, key = %reference.key, bytes, "Output stored as artifact");
    Ok(Delivered {
        binding: json!({"$artifact": reference.key}),
        output: NodeOutput::Artifact { reference },
        output_bytes: bytes,
    })
}
