//! Engine facade.
//!
//! An [`Engine`] is an explicitly constructed instance owning the artifact
//! store, side-effect ledger, stream lifecycle manager, checkpoint manager,
//! performance monitor and event sink. Nothing is global: several engines,
//! and several concurrent runs per engine, can live in one process.

#[cfg(test)]
mod integration_tests;

use crate::cancellation::CancellationToken;
use crate::checkpoint::{CheckpointManager, CompensationStrategy, RestoreResult};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::events::{EventSink, NoOpEventSink};
use crate::graph::{ExecutionGraph, RunInputs};
use crate::ledger::{
    CompensationHandler, CompensationRegistry, CompensationReport, CompensationResult, MatchRule,
    SideEffectEntry, SideEffectLedger,
};
use crate::monitor::PerformanceMonitor;
use crate::observability::WideEventEmitter;
use crate::ports::{
    AgentInvoker, ArtifactStore, InMemoryArtifactStore, InMemoryRecordStore, RecordStore,
    WorkflowStateProvider,
};
use crate::scheduler::{ExecutionResult, RunOptions, Scheduler, SchedulerParts};
use crate::streaming::{StreamLifecycleManager, StreamingThresholds, ThresholdRecommendation};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    invoker: Arc<dyn AgentInvoker>,
    store: Option<Arc<dyn ArtifactStore>>,
    records: Option<Arc<dyn RecordStore>>,
    events: Option<Arc<dyn EventSink>>,
    state_provider: Option<Arc<dyn WorkflowStateProvider>>,
    registry: Arc<CompensationRegistry>,
    wide_events: Option<WideEventEmitter>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("handlers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Starts a builder around the agent invocation port.
    #[must_use]
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            config: EngineConfig::default(),
            invoker,
            store: None,
            records: None,
            events: None,
            state_provider: None,
            registry: Arc::new(CompensationRegistry::new()),
            wide_events: Some(WideEventEmitter::new()),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `store` instead of an in-memory store sized from the config.
    #[must_use]
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses `records` for stream checkpoints and execution snapshots.
    #[must_use]
    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the provider stream resurrection validates against.
    #[must_use]
    pub fn state_provider(mut self, provider: Arc<dyn WorkflowStateProvider>) -> Self {
        self.state_provider = Some(provider);
        self
    }

    /// Registers a compensation handler. Rules are tried in registration
    /// order.
    #[must_use]
    pub fn compensation_handler(self, rule: MatchRule, handler: Arc<dyn CompensationHandler>) -> Self {
        self.registry.register(rule, handler);
        self
    }

    /// Disables the per-run wide summary event.
    #[must_use]
    pub fn without_wide_events(mut self) -> Self {
        self.wide_events = None;
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the ledger
    /// journal cannot be opened.
    pub fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;

        let events = self
            .events
            .unwrap_or_else(|| Arc::new(NoOpEventSink) as Arc<dyn EventSink>);
        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemoryArtifactStore::new(self.config.artifacts.store_capacity_bytes))
                as Arc<dyn ArtifactStore>
        });
        let records = self
            .records
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()) as Arc<dyn RecordStore>);

        let ledger = Arc::new(SideEffectLedger::from_config(
            self.registry,
            self.config.ledger.clone(),
            Arc::clone(&events),
        )?);

        let mut streams = StreamLifecycleManager::new(
            self.config.streams.clone(),
            Arc::clone(&store),
            Arc::clone(&records),
            Arc::clone(&events),
        )
        .with_invoker(Arc::clone(&self.invoker));
        if let Some(provider) = self.state_provider {
            streams = streams.with_state_provider(provider);
        }
        let streams = Arc::new(streams);

        let checkpoints = Arc::new(CheckpointManager::new(
            records,
            Arc::clone(&ledger),
            Arc::clone(&events),
            self.config.checkpoints.clone(),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(self.config.monitor.clone()));

        let parts = SchedulerParts {
            invoker: self.invoker,
            store,
            streams,
            ledger,
            checkpoints,
            monitor,
            events,
        };
        let scheduler = Scheduler::new(self.config.clone(), parts.clone());

        debug!(max_concurrency = self.config.scheduler.max_concurrency, "Engine built");
        Ok(Engine {
            config: self.config,
            parts,
            scheduler,
            wide_events: self.wide_events,
            shutdown: CancellationToken::new(),
            background: Mutex::new(None),
        })
    }
}

/// Executes agent workflow graphs.
pub struct Engine {
    config: EngineConfig,
    parts: SchedulerParts,
    scheduler: Scheduler,
    wide_events: Option<WideEventEmitter>,
    shutdown: CancellationToken,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("scheduler", &self.scheduler)
            .field("active_streams", &self.parts.streams.active_count())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts a builder.
    #[must_use]
    pub fn builder(invoker: Arc<dyn AgentInvoker>) -> EngineBuilder {
        EngineBuilder::new(invoker)
    }

    /// Runs `graph` with a fresh cancellation token.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the graph is invalid. Node failures
    /// are reported in the result.
    pub async fn run(&self, graph: &ExecutionGraph, inputs: &RunInputs) -> Result<ExecutionResult, EngineError> {
        self.run_with(graph, inputs, &RunOptions::new()).await
    }

    /// Runs `graph` with per-run overrides such as the failure policy.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn run_with(
        &self,
        graph: &ExecutionGraph,
        inputs: &RunInputs,
        options: &RunOptions,
    ) -> Result<ExecutionResult, EngineError> {
        self.run_with_token(graph, inputs, options, &CancellationToken::new())
            .await
    }

    /// Runs `graph`; cancelling `token` stops in-flight nodes and rolls back
    /// the run's side effects.
    ///
    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn run_with_token(
        &self,
        graph: &ExecutionGraph,
        inputs: &RunInputs,
        options: &RunOptions,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let result = self.scheduler.run(graph, inputs, options, token).await?;
        self.summarize(&result);
        Ok(result)
    }

    /// Continues a run from an execution snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is missing or the graph is invalid.
    pub async fn resume(&self, graph: &ExecutionGraph, snapshot_id: Uuid) -> Result<ExecutionResult, EngineError> {
        self.resume_with_token(graph, snapshot_id, &RunOptions::new(), &CancellationToken::new())
            .await
    }

    /// [`Self::resume`] with per-run overrides and an explicit cancellation
    /// token. Cancelling only rolls back effects recorded by the resumed part.
    ///
    /// # Errors
    ///
    /// See [`Self::resume`].
    pub async fn resume_with_token(
        &self,
        graph: &ExecutionGraph,
        snapshot_id: Uuid,
        options: &RunOptions,
        token: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let snapshot = self.parts.checkpoints.load(snapshot_id).await?;
        info!(run_id = %snapshot.run_id, %snapshot_id, "Resuming run");
        let result = self.scheduler.resume(graph, snapshot, options, token).await?;
        self.summarize(&result);
        Ok(result)
    }

    /// Rolls back the effects recorded after a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is missing or the ledger fails.
    pub async fn restore(
        &self,
        snapshot_id: Uuid,
        strategy: CompensationStrategy,
    ) -> Result<RestoreResult, EngineError> {
        self.parts.checkpoints.restore(snapshot_id, strategy).await
    }

    /// The next effect after a snapshot awaiting external confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is missing.
    pub async fn next_pending_effect(&self, snapshot_id: Uuid) -> Result<Option<SideEffectEntry>, EngineError> {
        self.parts.checkpoints.next_pending_effect(snapshot_id).await
    }

    /// Compensates one effect, typically after confirming it.
    ///
    /// # Errors
    ///
    /// Returns an error if the effect is unknown or the ledger fails.
    pub async fn compensate_effect(&self, effect_id: Uuid) -> Result<CompensationResult, EngineError> {
        self.parts.ledger.compensate(effect_id).await
    }

    /// Compensates every effect of a node, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger fails.
    pub async fn compensate_node(&self, node_id: &str) -> Result<CompensationReport, EngineError> {
        self.parts.ledger.compensate_all_for_node(node_id).await
    }

    /// Threshold changes suggested by recent samples.
    #[must_use]
    pub fn recommendations(&self) -> Vec<ThresholdRecommendation> {
        self.parts.monitor.recommendations(&self.scheduler.thresholds())
    }

    /// Applies the current recommendations to future runs and returns them.
    pub fn apply_recommendations(&self) -> Vec<ThresholdRecommendation> {
        let recommendations = self.recommendations();
        if recommendations.is_empty() {
            return recommendations;
        }
        let updated = self.scheduler.thresholds().apply(&recommendations);
        info!(
            changes = recommendations.len(),
            large_input_bytes = updated.large_input_bytes,
            tee_threshold_bytes = updated.tee_threshold_bytes,
            "Applied streaming threshold recommendations"
        );
        self.scheduler.set_thresholds(updated);
        recommendations
    }

    /// Thresholds used by new runs.
    #[must_use]
    pub fn thresholds(&self) -> StreamingThresholds {
        self.scheduler.thresholds()
    }

    /// Starts periodic stream checkpointing and checkpoint expiry. Calling it
    /// again while running does nothing.
    pub fn start_background(&self) {
        let mut background = self.background.lock();
        if background.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *background = Some(self.parts.streams.spawn_checkpoint_loop(self.shutdown.clone()));
    }

    /// Stops background work and suspends every active stream.
    pub async fn shutdown(&self) {
        self.shutdown.cancel("engine shutdown");
        let handle = self.background.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for stream in self.parts.streams.active_streams() {
            if let Err(err) = self.parts.streams.suspend(stream.stream_id).await {
                tracing::warn!(stream_id = %stream.stream_id, error = %err, "Failed to suspend stream on shutdown");
            }
        }
        info!("Engine shut down");
    }

    /// The configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The side-effect ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<SideEffectLedger> {
        &self.parts.ledger
    }

    /// The stream lifecycle manager.
    #[must_use]
    pub fn streams(&self) -> &Arc<StreamLifecycleManager> {
        &self.parts.streams
    }

    /// The checkpoint manager.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.parts.checkpoints
    }

    /// The performance monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.parts.monitor
    }

    /// The artifact store.
    #[must_use]
    pub fn artifact_store(&self) -> &Arc<dyn ArtifactStore> {
        &self.parts.store
    }

    /// The event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.parts.events
    }

    fn summarize(&self, result: &ExecutionResult) {
        if let Some(emitter) = &self.wide_events {
            emitter.emit_run_event(self.parts.events.as_ref(), result);
        }
    }
}
