//! Level-by-level execution of a validated graph.
//!
//! The scheduler computes topological levels, dispatches each level onto a
//! bounded pool of execution slots and waits for every member to become
//! terminal before the next level starts. Failure handling follows the run's
//! [`FailurePolicy`]; cancellation reaches every in-flight node and rolls back
//! the run's recorded side effects newest-first.

mod executor;
mod inputs;
pub mod policy;
mod result;
pub mod retry;
mod state;

pub use policy::{AfterRetry, FailureCollector, FailurePolicy, FailureRecord, FailureSummary};
pub use result::{ExecutionResult, RunStatus};
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision, RetryState};
pub use state::{ExecutionContext, ExecutionState, NodeExecutionState, NodeOutput};

use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointManager, ExecutionSnapshot};
use crate::config::EngineConfig;
use crate::core::NodeStatus;
use crate::errors::EngineError;
use crate::events::{names, EngineEvent, EventSink};
use crate::graph::{ExecutionGraph, RunInputs};
use crate::ledger::{CompensationReport, SideEffectLedger};
use crate::monitor::{ExecutionSample, PerformanceMonitor};
use crate::ports::{AgentInvoker, ArtifactStore, StaticStateProvider, WorkflowStateProvider};
use crate::streaming::{StrategyInput, StrategySelector, StreamLifecycleManager, StreamingThresholds};
use crate::utils::generate_id;
use executor::{execute_node, NodeCompletion, NodeJob, NodeRuntime};
use futures::FutureExt;
use inputs::resolve_inputs;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators the scheduler drives.
#[derive(Clone)]
pub struct SchedulerParts {
    /// Agent invocation port.
    pub invoker: Arc<dyn AgentInvoker>,
    /// Output and materialization storage.
    pub store: Arc<dyn ArtifactStore>,
    /// Stream registration, tee and checkpointing.
    pub streams: Arc<StreamLifecycleManager>,
    /// Side-effect ledger.
    pub ledger: Arc<SideEffectLedger>,
    /// Execution snapshots.
    pub checkpoints: Arc<CheckpointManager>,
    /// Performance sampling.
    pub monitor: Arc<PerformanceMonitor>,
    /// Event sink.
    pub events: Arc<dyn EventSink>,
}

/// Runs graphs. One scheduler serves any number of concurrent runs; each run
/// gets its own execution pool.
pub struct Scheduler {
    config: EngineConfig,
    selector: RwLock<StrategySelector>,
    parts: SchedulerParts,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("scheduler", &self.config.scheduler)
            .field("thresholds", self.selector.read().thresholds())
            .finish_non_exhaustive()
    }
}

/// Per-run settings that override the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Failure policy for this run; the configured one when unset.
    pub failure_policy: Option<FailurePolicy>,
}

impl RunOptions {
    /// Options that defer to the engine configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure policy for this run.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }
}

/// Per-run bookkeeping threaded through the level loop.
struct RunLoop<'a> {
    graph: &'a ExecutionGraph,
    levels: &'a [Vec<String>],
    level_of: HashMap<&'a str, usize>,
    state: ExecutionState,
    failures: FailureCollector,
    last_snapshot: Option<(Uuid, usize)>,
    /// Ledger position when this execution started. Cancellation only rolls
    /// back what was recorded after it.
    ledger_cursor: u64,
}

impl Scheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(config: EngineConfig, parts: SchedulerParts) -> Self {
        let selector = StrategySelector::new(config.streaming.clone());
        Self {
            config,
            selector: RwLock::new(selector),
            parts,
        }
    }

    /// The streaming thresholds new runs select strategies with.
    #[must_use]
    pub fn thresholds(&self) -> StreamingThresholds {
        self.selector.read().thresholds().clone()
    }

    /// Replaces the streaming thresholds. Runs already in progress keep the
    /// thresholds they started with.
    pub fn set_thresholds(&self, thresholds: StreamingThresholds) {
        *self.selector.write() = StrategySelector::new(thresholds);
    }

    /// Runs `graph` to completion.
    ///
    /// # Errors
    ///
    /// Returns a precondition error (cycle, unknown slot, missing required
    /// input) before any node executes. Node failures are reported in the
    /// result, not as errors.
    pub async fn run(
        &self,
        graph: &ExecutionGraph,
        inputs: &RunInputs,
        options: &RunOptions,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute(graph, inputs, None, options, token).await
    }

    /// Continues the run captured by `snapshot`. Successful nodes keep their
    /// outputs; every other node is scheduled again under the same run id.
    /// Cancelling the continuation only rolls back effects recorded after it
    /// started.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn resume(
        &self,
        graph: &ExecutionGraph,
        snapshot: ExecutionSnapshot,
        options: &RunOptions,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let ExecutionSnapshot { state, inputs, .. } = snapshot;
        self.execute(graph, &inputs, Some(state), options, token).await
    }

    async fn execute(
        &self,
        graph: &ExecutionGraph,
        inputs: &RunInputs,
        resumed: Option<ExecutionState>,
        options: &RunOptions,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let started = Instant::now();
        let levels = graph.validate(inputs)?;
        let ledger_cursor = self.parts.ledger.cursor();
        let policy = options
            .failure_policy
            .as_ref()
            .unwrap_or(&self.config.scheduler.failure_policy);

        let resuming = resumed.is_some();
        let mut failures = FailureCollector::new(policy);
        let state = match resumed {
            Some(mut state) => {
                prepare_resume(&mut state, graph, &mut failures);
                state
            }
            None => ExecutionState::new(generate_id(), graph),
        };
        let run_id = state.run_id;

        // Resumed runs validate resurrected streams against what the
        // snapshot recorded, not against whatever the graph says now.
        let provider = resuming.then(|| {
            let recorded = state
                .nodes()
                .iter()
                .filter(|(_, node)| !node.input_snapshot.is_empty())
                .map(|(id, node)| (id.clone(), node.input_snapshot.clone()))
                .collect();
            StaticStateProvider::from_graph(graph, recorded)
        });

        info!(%run_id, nodes = graph.len(), levels = levels.len(), resumed = resuming, "Run started");
        self.parts.events.try_emit(
            EngineEvent::new(names::RUN_STARTED)
                .with_run(run_id)
                .with_data(json!({
                    "nodes": graph.len(),
                    "levels": levels.len(),
                    "resumed": resuming,
                })),
        );

        let runtime = Arc::new(NodeRuntime {
            run_id,
            invoker: Arc::clone(&self.parts.invoker),
            store: Arc::clone(&self.parts.store),
            streams: Arc::clone(&self.parts.streams),
            ledger: Arc::clone(&self.parts.ledger),
            events: Arc::clone(&self.parts.events),
            pool: Arc::new(Semaphore::new(self.config.scheduler.max_concurrency.max(1))),
            token: token.clone(),
            default_timeout: self.config.scheduler.default_timeout(),
            run_retry: policy.run_retry().cloned(),
            inline_limit_bytes: u64::try_from(self.config.artifacts.inline_output_limit_bytes)
                .unwrap_or(u64::MAX),
        });
        let selector = self.selector.read().clone();

        let level_of = levels
            .iter()
            .enumerate()
            .flat_map(|(index, level)| level.iter().map(move |id| (id.as_str(), index)))
            .collect();
        let mut run = RunLoop {
            graph,
            levels: &levels,
            level_of,
            state,
            failures,
            last_snapshot: None,
            ledger_cursor,
        };

        for (index, level) in levels.iter().enumerate() {
            if token.is_cancelled() || run.failures.should_stop() {
                break;
            }
            self.run_level(
                &mut run,
                index,
                level,
                inputs,
                &runtime,
                &selector,
                provider.as_ref().map(|p| p as &dyn WorkflowStateProvider),
                token,
            )
            .await;
            if token.is_cancelled() {
                break;
            }

            run.state.completed_levels = index + 1;
            self.parts.events.try_emit(
                EngineEvent::new(names::LEVEL_COMPLETED)
                    .with_run(run_id)
                    .with_data(json!({"level": index})),
            );
            if self.parts.checkpoints.is_due(run.state.completed_levels) {
                self.snapshot(&mut run, inputs).await;
            }
        }

        Ok(self.finish(run, inputs, token, started).await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_level(
        &self,
        run: &mut RunLoop<'_>,
        index: usize,
        level: &[String],
        inputs: &RunInputs,
        runtime: &Arc<NodeRuntime>,
        selector: &StrategySelector,
        provider: Option<&dyn WorkflowStateProvider>,
        token: &CancellationToken,
    ) {
        let run_id = run.state.run_id;
        debug!(%run_id, level = index, nodes = level.len(), "Dispatching level");
        self.parts.events.try_emit(
            EngineEvent::new(names::LEVEL_STARTED)
                .with_run(run_id)
                .with_data(json!({"level": index, "nodes": level})),
        );

        let mut tasks = JoinSet::new();
        for node_id in level {
            if run.state.status(node_id) == Some(NodeStatus::Success) {
                continue;
            }
            let Some(node) = run.graph.node(node_id) else {
                continue;
            };

            if !run.failures.can_run(&run.graph.predecessors(node_id)) {
                self.skip_node(run, node_id, index).await;
                continue;
            }

            let resolved = match resolve_inputs(
                run.graph,
                node,
                &run.state,
                inputs,
                self.parts.store.as_ref(),
                &self.parts.streams,
                provider,
                token,
            )
            .await
            {
                Ok(resolved) => resolved,
                Err(err) => {
                    self.abandon_inputs(run, node_id).await;
                    run.state.node_mut(node_id).start(index);
                    self.fail_node(run, node_id, &err, 1);
                    continue;
                }
            };

            let fan_out = run.graph.fan_out(node_id);
            let facts = StrategyInput {
                declared: node.config.streaming,
                has_streamed_input: resolved.has_streams(),
                input_bytes: resolved.bytes,
                fan_out,
                estimated_output_bytes: node.config.estimated_output_bytes,
                hints: self.parts.invoker.hints(&node.config.agent_type),
                consumers_staggered: self.consumers_staggered(run, node_id),
            };
            let strategy = selector.select(&facts);
            debug!(%run_id, node_id = %node_id, %strategy, fan_out, input_bytes = resolved.bytes, "Strategy selected");
            self.parts.events.try_emit(
                EngineEvent::new(names::STRATEGY_SELECTED)
                    .with_run(run_id)
                    .with_node(node_id.clone())
                    .with_data(json!({
                        "strategy": strategy,
                        "reason": selector.reason(&facts),
                        "fan_out": fan_out,
                        "input_bytes": resolved.bytes,
                    })),
            );

            let node_state = run.state.node_mut(node_id);
            node_state.start(index);
            node_state.strategy = Some(strategy);
            node_state.input_snapshot = resolved.snapshot.clone();

            let job = NodeJob {
                node: node.clone(),
                level: index,
                strategy,
                fan_out,
                inputs: resolved,
            };
            let runtime = Arc::clone(runtime);
            let id = node_id.clone();
            tasks.spawn(async move {
                AssertUnwindSafe(execute_node(runtime, job))
                    .catch_unwind()
                    .await
                    .map_err(|_| id)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(completion)) => self.settle(run, completion),
                Ok(Err(node_id)) => {
                    error!(%run_id, node_id = %node_id, "Node task panicked");
                    let err = EngineError::node(&node_id, "agent panicked", false);
                    self.fail_node(run, &node_id, &err, 1);
                }
                Err(join_err) => error!(%run_id, error = %join_err, "Node task aborted"),
            }
        }
    }

    /// Outputs whose consumers will not all read at once: successors spread
    /// over several levels, a successor level wider than the pool, or one
    /// successor wired twice to the same producer.
    fn consumers_staggered(&self, run: &RunLoop<'_>, node_id: &str) -> bool {
        let mut targets = HashSet::new();
        let mut target_levels = HashSet::new();
        for edge in run.graph.outgoing(node_id) {
            if !targets.insert(edge.target.as_str()) {
                return true;
            }
            if let Some(level) = run.level_of.get(edge.target.as_str()) {
                target_levels.insert(*level);
            }
        }
        if target_levels.len() > 1 {
            return true;
        }
        target_levels
            .iter()
            .any(|level| run.levels[*level].len() > self.config.scheduler.max_concurrency)
    }

    fn settle(&self, run: &mut RunLoop<'_>, completion: NodeCompletion) {
        let run_id = run.state.run_id;
        let node_id = completion.node_id.clone();
        let retries = completion.attempts.saturating_sub(1);

        match completion.outcome {
            Ok(delivered) => {
                let node_state = run.state.node_mut(&node_id);
                if completion.started_at.is_some() {
                    node_state.started_at = completion.started_at;
                }
                node_state.retry_count = retries;
                node_state.succeed(delivered.output);
                let duration_ms = node_state.duration_ms().unwrap_or(0);
                run.state.context.bind(node_id.clone(), delivered.binding);
                run.failures.record_completion(&node_id);

                info!(%run_id, node_id = %node_id, duration_ms, retries, strategy = %completion.strategy, "Node completed");
                self.parts.events.try_emit(
                    EngineEvent::new(names::NODE_COMPLETED)
                        .with_run(run_id)
                        .with_node(node_id.clone())
                        .with_data(json!({
                            "level": completion.level,
                            "duration_ms": duration_ms,
                            "attempts": completion.attempts,
                            "strategy": completion.strategy,
                            "output_bytes": delivered.output_bytes,
                        })),
                );
                self.parts.monitor.record(
                    ExecutionSample::new(node_id, completion.agent_type, completion.strategy)
                        .with_sizes(completion.input_bytes, delivered.output_bytes)
                        .with_fan_out(completion.fan_out)
                        .with_duration_ms(completion.attempt_ms),
                );
            }
            Err(EngineError::Cancelled(reason)) => {
                let node_state = run.state.node_mut(&node_id);
                node_state.retry_count = retries;
                node_state.cancel(reason.clone());
                debug!(%run_id, node_id = %node_id, reason = %reason, "Node cancelled");
                self.parts.events.try_emit(
                    EngineEvent::warning(names::NODE_CANCELLED)
                        .with_run(run_id)
                        .with_node(node_id)
                        .with_data(json!({"reason": reason})),
                );
            }
            Err(err) => self.fail_node(run, &node_id, &err, completion.attempts),
        }
    }

    fn fail_node(&self, run: &mut RunLoop<'_>, node_id: &str, err: &EngineError, attempts: u32) {
        let run_id = run.state.run_id;
        let kind = err.kind();
        let node_state = run.state.node_mut(node_id);
        node_state.retry_count = attempts.saturating_sub(1);
        node_state.fail(err.to_string(), kind);
        run.failures.record_failure(
            FailureRecord::new(node_id, err.to_string())
                .with_kind(kind.as_str())
                .with_attempts(attempts),
        );

        warn!(%run_id, node_id, error = %err, attempts, "Node failed");
        self.parts.events.try_emit(
            EngineEvent::error(names::NODE_FAILED)
                .with_run(run_id)
                .with_node(node_id.to_string())
                .with_data(json!({
                    "error": err.to_dict(),
                    "attempts": attempts,
                })),
        );
    }

    async fn skip_node(&self, run: &mut RunLoop<'_>, node_id: &str, level: usize) {
        self.abandon_inputs(run, node_id).await;
        let node_state = run.state.node_mut(node_id);
        node_state.level = Some(level);
        node_state.skip("upstream node failed or was skipped");
        run.failures.record_skip(node_id);

        info!(run_id = %run.state.run_id, node_id, "Node skipped");
        self.parts.events.try_emit(
            EngineEvent::warning(names::NODE_SKIPPED)
                .with_run(run.state.run_id)
                .with_node(node_id.to_string())
                .with_data(json!({"reason": "upstream failure"})),
        );
    }

    /// Gives up this node's reader on every upstream stream so tee siblings
    /// are not held back by a branch nobody will drain.
    async fn abandon_inputs(&self, run: &RunLoop<'_>, node_id: &str) {
        for edge in run.graph.incoming(node_id) {
            let Some(stream_id) = run
                .state
                .node(&edge.source)
                .and_then(|source| source.output.as_ref())
                .and_then(NodeOutput::stream_id)
            else {
                continue;
            };
            let Some(index) = run
                .graph
                .outgoing(&edge.source)
                .position(|candidate| std::ptr::eq(candidate, edge))
            else {
                continue;
            };
            if let Err(err) = self.parts.streams.abandon(stream_id, index).await {
                warn!(%stream_id, node_id, error = %err, "Failed to abandon stream consumer");
            }
        }
    }

    async fn snapshot(&self, run: &mut RunLoop<'_>, inputs: &RunInputs) {
        match self.parts.checkpoints.snapshot(&run.state, inputs).await {
            Ok(id) => run.last_snapshot = Some((id, run.state.completed_levels)),
            Err(err) => warn!(run_id = %run.state.run_id, error = %err, "Execution snapshot failed"),
        }
    }

    async fn finish(
        &self,
        mut run: RunLoop<'_>,
        inputs: &RunInputs,
        token: &CancellationToken,
        started: Instant,
    ) -> ExecutionResult {
        let run_id = run.state.run_id;
        let suspended = self.parts.streams.suspend_run(run_id).await;
        if !suspended.is_empty() {
            debug!(%run_id, streams = suspended.len(), "Suspended open streams");
        }

        let mut compensation: Option<CompensationReport> = None;
        let mut error = None;
        let status = if token.is_cancelled() {
            let reason = token.reason().unwrap_or_else(|| "run cancelled".to_string());
            for node_id in run.state.nodes_with_status(NodeStatus::Pending) {
                run.state.node_mut(&node_id).cancel(reason.clone());
            }
            match self
                .parts
                .ledger
                .compensate_since(run.ledger_cursor, Some(run_id))
                .await
            {
                Ok(report) => {
                    if !report.is_complete() {
                        error = Some(format!(
                            "cancelled: {} effect(s) left unresolved",
                            report.unresolved.len()
                        ));
                    }
                    compensation = Some(report);
                }
                Err(err) => {
                    error!(%run_id, error = %err, "Compensation after cancellation failed");
                    error = Some(format!("cancelled: compensation failed: {err}"));
                }
            }
            if error.is_none() {
                error = Some(format!("cancelled: {reason}"));
            }
            self.snapshot(&mut run, inputs).await;
            RunStatus::Cancelled
        } else if run.failures.should_stop() {
            error = run
                .failures
                .failures()
                .first()
                .map(|failure| format!("node '{}' failed: {}", failure.node_id, failure.error));
            RunStatus::Failed
        } else if !run.failures.failures().is_empty()
            || !run.state.nodes_with_status(NodeStatus::Skipped).is_empty()
        {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        let cadence = self.config.checkpoints.snapshot_every_levels.is_some_and(|n| n > 0);
        if status != RunStatus::Cancelled
            && cadence
            && run.last_snapshot.map(|(_, at)| at) != Some(run.state.completed_levels)
        {
            self.snapshot(&mut run, inputs).await;
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary = run.failures.summary(run.graph.len());
        let name = if status == RunStatus::Cancelled {
            names::RUN_CANCELLED
        } else {
            names::RUN_COMPLETED
        };
        info!(%run_id, %status, duration_ms, failed = summary.failed_nodes, "Run finished");
        self.parts.events.try_emit(
            EngineEvent::new(name)
                .with_run(run_id)
                .with_data(json!({
                    "status": status,
                    "duration_ms": duration_ms,
                    "failed_nodes": summary.failed_nodes,
                    "skipped_nodes": summary.skipped_nodes.len(),
                    "error": error,
                })),
        );

        ExecutionResult {
            run_id,
            status,
            levels: run.levels.to_vec(),
            failures: summary,
            compensation,
            snapshot_id: run.last_snapshot.map(|(id, _)| id),
            duration_ms,
            error,
            state: run.state,
        }
    }
}

/// Resets every node that did not succeed and forgets its bindings. Nodes
/// added to the graph since the snapshot start pending.
fn prepare_resume(state: &mut ExecutionState, graph: &ExecutionGraph, failures: &mut FailureCollector) {
    for node in graph.nodes() {
        let node_state = state.node_mut(&node.id);
        if node_state.status == NodeStatus::Success {
            failures.record_completion(&node.id);
        } else {
            node_state.reset();
            state.context.unbind(&node.id);
        }
    }
    state.completed_levels = 0;
}
