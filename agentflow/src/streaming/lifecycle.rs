//! Ownership of active streams.
//!
//! The manager registers producer streams, hands out one reader per consumer
//! (teed or replayed from a materialized artifact), checkpoints long-lived
//! streams to the artifact and record stores, and resurrects checkpointed
//! streams after validating their staleness.
//!
//! Each stream has its own lock; the manager itself is never locked as a
//! whole.

use super::capture::{capture, CaptureBuffer, SharedCapture};
use super::checkpoint::{CheckpointStatus, MaterializationMode, StreamCheckpoint};
use super::materialize::{materialize, replay, MaterializedStream};
use super::reader::{ChunkSource, Provenance, StreamReader};
use super::staleness::{inputs_version, StalenessReport, StalenessSeverity, StalenessValidator};
use super::strategy::StreamingStrategy;
use super::tee::tee_n;
use super::{from_chunks, ChunkStream};
use crate::cancellation::CancellationToken;
use crate::config::StreamLifecycleConfig;
use crate::core::ArtifactReference;
use crate::errors::{EngineError, ResourceError, ResurrectionError};
use crate::events::{names, EngineEvent, EventSink};
use crate::graph::Node;
use crate::ports::{
    get_json, load_record, put_json, save_record, AgentInputs, AgentInvoker, AgentOutput,
    ArtifactStore, InvocationContext, InvocationPurpose, RecordStore, StoreHints,
    WorkflowStateProvider, STREAM_CHECKPOINTS,
};
use crate::utils::{age_of, generate_id, now_utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The producer side of a stream being registered.
#[derive(Debug, Clone)]
pub struct StreamProducer {
    /// Run the producer belongs to.
    pub run_id: Uuid,
    /// Producing node, as executed.
    pub node: Node,
    /// The node's resolved value inputs.
    pub inputs: HashMap<String, Value>,
    /// Strategy selected for the node.
    pub strategy: StreamingStrategy,
}

/// Identifies a registered stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandle {
    /// Stream id.
    pub stream_id: Uuid,
    /// Run the stream belongs to.
    pub run_id: Uuid,
    /// Producing node.
    pub source_node: String,
    /// Number of consumer readers.
    pub consumers: usize,
    /// Delivery strategy.
    pub strategy: StreamingStrategy,
    /// What a checkpoint of this stream keeps.
    pub mode: MaterializationMode,
}

struct ActiveStream {
    handle: StreamHandle,
    branches: Vec<Option<ChunkStream>>,
    released: Vec<bool>,
    materialized: Option<MaterializedStream>,
    capture: SharedCapture,
    record: StreamCheckpoint,
    registered: Instant,
    last_checkpoint: Option<Instant>,
}

struct Slot {
    handle: StreamHandle,
    state: Arc<Mutex<ActiveStream>>,
}

/// Owns active stream handles, their checkpoints and their resurrection.
pub struct StreamLifecycleManager {
    config: StreamLifecycleConfig,
    store: Arc<dyn ArtifactStore>,
    records: Arc<dyn RecordStore>,
    events: Arc<dyn EventSink>,
    state: Option<Arc<dyn WorkflowStateProvider>>,
    invoker: Option<Arc<dyn AgentInvoker>>,
    validator: StalenessValidator,
    active: DashMap<Uuid, Slot>,
    resurrections: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for StreamLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLifecycleManager")
            .field("active", &self.active.len())
            .field("has_state_provider", &self.state.is_some())
            .field("has_invoker", &self.invoker.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamLifecycleManager {
    /// Creates a manager without a state provider or invoker.
    #[must_use]
    pub fn new(
        config: StreamLifecycleConfig,
        store: Arc<dyn ArtifactStore>,
        records: Arc<dyn RecordStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let validator = StalenessValidator::new(config.critical_fields.clone());
        Self {
            config,
            store,
            records,
            events,
            state: None,
            invoker: None,
            validator,
            active: DashMap::new(),
            resurrections: DashMap::new(),
        }
    }

    /// Sets the provider used for staleness validation.
    #[must_use]
    pub fn with_state_provider(mut self, provider: Arc<dyn WorkflowStateProvider>) -> Self {
        self.state = Some(provider);
        self
    }

    /// Sets the invoker used to regenerate streams.
    #[must_use]
    pub fn with_invoker(mut self, invoker: Arc<dyn AgentInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Number of active streams.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Handles of all active streams.
    #[must_use]
    pub fn active_streams(&self) -> Vec<StreamHandle> {
        self.active.iter().map(|slot| slot.handle.clone()).collect()
    }

    fn slot(&self, stream_id: Uuid) -> Option<Arc<Mutex<ActiveStream>>> {
        self.active.get(&stream_id).map(|slot| Arc::clone(&slot.state))
    }

    fn emit(&self, event: EngineEvent) {
        self.events.try_emit(event);
    }

    /// Registers a producer stream with `consumer_count` readers.
    ///
    /// Tee and single streams are split into one live branch per consumer.
    /// Materialized streams are drained on [`Self::materialize`] or on the
    /// first reader request.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::StreamSlotsExhausted`] when the active stream
    /// limit is reached.
    pub fn register(
        &self,
        producer: StreamProducer,
        raw: ChunkStream,
        consumer_count: usize,
    ) -> Result<StreamHandle, EngineError> {
        if self.active.len() >= self.config.max_active_streams {
            return Err(ResourceError::StreamSlotsExhausted {
                limit: self.config.max_active_streams,
            }
            .into());
        }

        let consumers = consumer_count.max(1);
        let mode = match producer.strategy {
            StreamingStrategy::StreamTee | StreamingStrategy::StreamMaterialize => {
                MaterializationMode::Full
            }
            StreamingStrategy::Batch | StreamingStrategy::StreamSingle => {
                self.config.single_stream_mode
            }
        };
        let buffer = match mode {
            MaterializationMode::Full => CaptureBuffer::unbounded(),
            MaterializationMode::Partial => CaptureBuffer::windowed(self.config.partial_window_chunks),
            MaterializationMode::Regenerate => CaptureBuffer::windowed(0),
        }
        .shared();

        let stream_id = generate_id();
        let captured = capture(raw, Arc::clone(&buffer));
        let branches = match producer.strategy {
            StreamingStrategy::StreamMaterialize => vec![Some(captured)],
            _ => tee_n(captured, consumers, self.config.tee_buffer_chunks)
                .into_iter()
                .map(Some)
                .collect(),
        };

        let now = now_utc();
        let record = StreamCheckpoint {
            stream_id,
            run_id: producer.run_id,
            source_node: producer.node.id.clone(),
            consumer_count: consumers,
            created_at: now,
            last_touch: now,
            config_version: producer.node.config_version()?,
            inputs_version: inputs_version(&producer.inputs)?,
            mode,
            status: CheckpointStatus::Active,
            chunks: None,
            captured_chunks: 0,
            complete: false,
            node_snapshot: producer.node,
            input_snapshot: producer.inputs,
            regenerated_at: None,
        };

        let handle = StreamHandle {
            stream_id,
            run_id: record.run_id,
            source_node: record.source_node.clone(),
            consumers,
            strategy: producer.strategy,
            mode,
        };

        let state = ActiveStream {
            handle: handle.clone(),
            branches,
            released: vec![false; consumers],
            materialized: None,
            capture: buffer,
            record,
            registered: Instant::now(),
            last_checkpoint: None,
        };
        self.active.insert(
            stream_id,
            Slot {
                handle: handle.clone(),
                state: Arc::new(Mutex::new(state)),
            },
        );

        debug!(
            %stream_id,
            node_id = %handle.source_node,
            consumers,
            strategy = %handle.strategy,
            "stream registered"
        );
        self.emit(
            EngineEvent::new(names::STREAM_REGISTERED)
                .with_run(handle.run_id)
                .with_node(handle.source_node.clone())
                .with_stream(stream_id)
                .with_data(json!({
                    "consumers": consumers,
                    "strategy": handle.strategy,
                    "mode": mode,
                })),
        );
        Ok(handle)
    }

    /// Drains a materialized stream into the artifact store.
    ///
    /// Calling it again returns the existing summary. On failure the stream
    /// is discarded.
    ///
    /// # Errors
    ///
    /// Returns the producer's fault as a node error, or the store's error.
    pub async fn materialize(&self, stream_id: Uuid) -> Result<MaterializedStream, EngineError> {
        let slot = self
            .slot(stream_id)
            .ok_or_else(|| EngineError::NotFound(format!("stream {stream_id}")))?;
        let mut stream = slot.lock().await;
        let result = self.materialize_locked(&mut stream).await;
        if result.is_err() {
            drop(stream);
            self.discard(stream_id);
        }
        result
    }

    async fn materialize_locked(
        &self,
        stream: &mut ActiveStream,
    ) -> Result<MaterializedStream, EngineError> {
        if let Some(done) = &stream.materialized {
            return Ok(done.clone());
        }
        let stream_id = stream.handle.stream_id;
        let source = stream
            .branches
            .first_mut()
            .and_then(Option::take)
            .ok_or_else(|| EngineError::NotFound(format!("source of stream {stream_id}")))?;

        let summary = materialize(
            source,
            self.store.as_ref(),
            ArtifactReference::for_materialized_stream(&stream_id),
            StoreHints::pinned(),
            &stream.handle.source_node,
        )
        .await?;

        stream.record.chunks = Some(summary.reference.clone());
        stream.record.captured_chunks = summary.chunks;
        stream.record.complete = true;
        stream.materialized = Some(summary.clone());
        Ok(summary)
    }

    /// Returns the reader for `consumer_index`.
    ///
    /// Streams that are no longer active are resurrected from their
    /// checkpoint using the configured state provider.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range, the reader was already taken, or
    /// resurrection fails.
    pub async fn acquire_reader(
        &self,
        stream_id: Uuid,
        consumer_index: usize,
    ) -> Result<StreamReader, EngineError> {
        self.acquire_reader_with(stream_id, consumer_index, None).await
    }

    /// Like [`Self::acquire_reader`], validating resurrections against
    /// `provider` instead of the configured one.
    ///
    /// # Errors
    ///
    /// See [`Self::acquire_reader`].
    pub async fn acquire_reader_with(
        &self,
        stream_id: Uuid,
        consumer_index: usize,
        provider: Option<&dyn WorkflowStateProvider>,
    ) -> Result<StreamReader, EngineError> {
        let Some(slot) = self.slot(stream_id) else {
            return self.resurrect_with(stream_id, consumer_index, provider).await;
        };
        let mut stream = slot.lock().await;

        if consumer_index >= stream.handle.consumers {
            return Err(ResurrectionError::ConsumerOutOfRange {
                stream_id,
                index: consumer_index,
                count: stream.handle.consumers,
            }
            .into());
        }
        if stream.released[consumer_index] {
            return Err(EngineError::NotFound(format!(
                "reader {consumer_index} of stream {stream_id} was released"
            )));
        }
        stream.record.touch();

        if stream.handle.strategy == StreamingStrategy::StreamMaterialize {
            let summary = match self.materialize_locked(&mut stream).await {
                Ok(summary) => summary,
                Err(err) => {
                    drop(stream);
                    self.discard(stream_id);
                    return Err(err);
                }
            };
            let chunks = replay(self.store.as_ref(), &summary.reference).await?;
            return Ok(StreamReader::new(
                stream_id,
                consumer_index,
                Provenance::cached(StalenessSeverity::Fresh),
                chunks,
            ));
        }

        let branch = stream
            .branches
            .get_mut(consumer_index)
            .and_then(Option::take)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "reader {consumer_index} of stream {stream_id} was already acquired"
                ))
            })?;
        Ok(StreamReader::new(stream_id, consumer_index, Provenance::live(), branch))
    }

    /// Releases a reader the consumer is done with.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint cannot be written.
    pub async fn release(&self, reader: StreamReader) -> Result<(), EngineError> {
        let (stream_id, index) = (reader.stream_id(), reader.consumer_index());
        drop(reader);
        self.release_consumer(stream_id, index).await
    }

    /// Marks a consumer as done without handing back its reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint cannot be written.
    pub async fn release_consumer(
        &self,
        stream_id: Uuid,
        consumer_index: usize,
    ) -> Result<(), EngineError> {
        self.finish_consumer(stream_id, consumer_index).await
    }

    /// Gives up a consumer that will never read (skipped or cancelled), so
    /// its tee branch stops holding back the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint cannot be written.
    pub async fn abandon(&self, stream_id: Uuid, consumer_index: usize) -> Result<(), EngineError> {
        if let Some(slot) = self.slot(stream_id) {
            let mut stream = slot.lock().await;
            if let Some(branch) = stream.branches.get_mut(consumer_index) {
                branch.take();
            }
        }
        self.finish_consumer(stream_id, consumer_index).await
    }

    async fn finish_consumer(&self, stream_id: Uuid, consumer_index: usize) -> Result<(), EngineError> {
        let Some(slot) = self.slot(stream_id) else {
            return Ok(());
        };
        let mut stream = slot.lock().await;
        if let Some(released) = stream.released.get_mut(consumer_index) {
            *released = true;
        }
        if !stream.released.iter().all(|r| *r) {
            return Ok(());
        }

        self.active.remove(&stream_id);
        self.persist(&mut stream, CheckpointStatus::Checkpointed).await?;
        debug!(%stream_id, "all consumers released, stream closed");
        Ok(())
    }

    /// Drops an active stream without writing a checkpoint.
    pub fn discard(&self, stream_id: Uuid) {
        if self.active.remove(&stream_id).is_some() {
            debug!(%stream_id, "stream discarded");
        }
    }

    async fn persist(
        &self,
        stream: &mut ActiveStream,
        status: CheckpointStatus,
    ) -> Result<(), EngineError> {
        let stream_id = stream.handle.stream_id;

        if stream.materialized.is_none() {
            if stream.handle.mode == MaterializationMode::Regenerate {
                stream.record.chunks = None;
                stream.record.captured_chunks = 0;
                stream.record.complete = false;
            } else {
                let snapshot = stream.capture.lock().snapshot();
                let reference = ArtifactReference::for_stream_checkpoint(&stream_id);
                put_json(
                    self.store.as_ref(),
                    &reference.key,
                    &snapshot.chunks,
                    StoreHints::pinned(),
                )
                .await?;
                stream.record.captured_chunks = snapshot.chunks.len() as u64;
                stream.record.complete = snapshot.complete && !snapshot.truncated;
                stream.record.chunks = Some(reference);
            }
        }

        stream.record.status = status;
        stream.record.touch();
        save_record(
            self.records.as_ref(),
            STREAM_CHECKPOINTS,
            &stream_id.to_string(),
            &stream.record,
        )
        .await?;
        stream.last_checkpoint = Some(Instant::now());
        Ok(())
    }

    /// Active streams older than the checkpoint age whose last checkpoint is
    /// older than the checkpoint interval. Streams busy elsewhere are skipped.
    #[must_use]
    pub fn checkpoint_due(&self) -> Vec<Uuid> {
        let age = self.config.checkpoint_age();
        let interval = self.config.checkpoint_interval();
        self.active
            .iter()
            .filter_map(|slot| {
                let stream = slot.state.try_lock().ok()?;
                let due = stream.registered.elapsed() >= age
                    && stream
                        .last_checkpoint
                        .map_or(true, |at| at.elapsed() >= interval);
                due.then_some(*slot.key())
            })
            .collect()
    }

    /// Checkpoints an active stream now.
    ///
    /// # Errors
    ///
    /// Fails if the stream is not active or the stores reject the write.
    pub async fn checkpoint_now(&self, stream_id: Uuid) -> Result<StreamCheckpoint, EngineError> {
        let slot = self
            .slot(stream_id)
            .ok_or_else(|| EngineError::NotFound(format!("stream {stream_id}")))?;
        let mut stream = slot.lock().await;
        self.persist(&mut stream, CheckpointStatus::Checkpointed).await?;

        debug!(%stream_id, chunks = stream.record.captured_chunks, "stream checkpointed");
        self.emit(
            EngineEvent::new(names::STREAM_CHECKPOINTED)
                .with_run(stream.handle.run_id)
                .with_node(stream.handle.source_node.clone())
                .with_stream(stream_id)
                .with_data(json!({
                    "mode": stream.record.mode,
                    "captured_chunks": stream.record.captured_chunks,
                    "complete": stream.record.complete,
                })),
        );
        Ok(stream.record.clone())
    }

    /// Checkpoints a stream and stops it. Later readers resurrect it.
    ///
    /// # Errors
    ///
    /// Fails if the stores reject the write.
    pub async fn suspend(&self, stream_id: Uuid) -> Result<(), EngineError> {
        let Some((_, slot)) = self.active.remove(&stream_id) else {
            return Ok(());
        };
        let mut stream = slot.state.lock().await;
        self.persist(&mut stream, CheckpointStatus::Checkpointed).await?;
        info!(%stream_id, node_id = %stream.handle.source_node, "stream suspended");
        Ok(())
    }

    /// Suspends every active stream of a run, returning their ids.
    pub async fn suspend_run(&self, run_id: Uuid) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .active
            .iter()
            .filter(|slot| slot.handle.run_id == run_id)
            .map(|slot| *slot.key())
            .collect();

        let mut suspended = Vec::with_capacity(ids.len());
        for id in ids {
            match self.suspend(id).await {
                Ok(()) => suspended.push(id),
                Err(err) => warn!(stream_id = %id, error = %err, "failed to suspend stream"),
            }
        }
        suspended
    }

    /// Spawns the periodic checkpoint and expiry loop. It stops when `token`
    /// is cancelled.
    pub fn spawn_checkpoint_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.checkpoint_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for stream_id in manager.checkpoint_due() {
                            if let Err(err) = manager.checkpoint_now(stream_id).await {
                                warn!(%stream_id, error = %err, "periodic checkpoint failed");
                            }
                        }
                        if let Err(err) = manager.expire_stale_checkpoints().await {
                            warn!(error = %err, "checkpoint expiry sweep failed");
                        }
                    }
                }
            }
            debug!("checkpoint loop stopped");
        })
    }

    /// Marks checkpoints older than the TTL as expired and deletes their
    /// stored chunks.
    ///
    /// # Errors
    ///
    /// Fails if the record store cannot be read.
    pub async fn expire_stale_checkpoints(&self) -> Result<Vec<Uuid>, EngineError> {
        let ttl = self.config.checkpoint_ttl();
        let mut expired = Vec::new();

        for id in self.records.list(STREAM_CHECKPOINTS).await? {
            let Some(mut record) =
                load_record::<StreamCheckpoint>(self.records.as_ref(), STREAM_CHECKPOINTS, &id).await?
            else {
                continue;
            };
            if record.status == CheckpointStatus::Expired || self.active.contains_key(&record.stream_id) {
                continue;
            }
            if age_of(&record.last_touch) > ttl {
                self.expire_record(&mut record).await?;
                expired.push(record.stream_id);
            }
        }
        Ok(expired)
    }

    async fn expire_record(&self, record: &mut StreamCheckpoint) -> Result<(), EngineError> {
        if let Some(chunks) = record.chunks.take() {
            self.store.unpin(&chunks.key).await?;
            self.store.delete(&chunks.key).await?;
        }
        record.status = CheckpointStatus::Expired;
        record.complete = false;
        save_record(
            self.records.as_ref(),
            STREAM_CHECKPOINTS,
            &record.stream_id.to_string(),
            record,
        )
        .await?;

        debug!(stream_id = %record.stream_id, "checkpoint expired");
        self.emit(
            EngineEvent::new(names::STREAM_EXPIRED)
                .with_run(record.run_id)
                .with_node(record.source_node.clone())
                .with_stream(record.stream_id),
        );
        Ok(())
    }

    /// Loads a stream's checkpoint record.
    ///
    /// # Errors
    ///
    /// Fails if the record store cannot be read.
    pub async fn checkpoint(&self, stream_id: Uuid) -> Result<Option<StreamCheckpoint>, EngineError> {
        load_record(self.records.as_ref(), STREAM_CHECKPOINTS, &stream_id.to_string()).await
    }

    /// Resurrects a checkpointed stream using the configured state provider.
    ///
    /// # Errors
    ///
    /// See [`Self::resurrect_with`].
    pub async fn resurrect(
        &self,
        stream_id: Uuid,
        consumer_index: usize,
    ) -> Result<StreamReader, EngineError> {
        self.resurrect_with(stream_id, consumer_index, None).await
    }

    /// Resurrects a checkpointed stream.
    ///
    /// Fresh or minor checkpoints with a complete cache replay it; minor
    /// drift is reported as a warning. Anything else regenerates from the
    /// snapshotted node and inputs when an invoker is available, and falls
    /// back to whatever was cached, with a warning, when it is not. The
    /// result is never presented as fresh unless it is.
    ///
    /// # Errors
    ///
    /// Returns a [`ResurrectionError`] when the checkpoint is missing or
    /// expired, the node was removed, no state provider is available, or
    /// neither regeneration nor a cache can produce the stream.
    pub async fn resurrect_with(
        &self,
        stream_id: Uuid,
        consumer_index: usize,
        provider: Option<&dyn WorkflowStateProvider>,
    ) -> Result<StreamReader, EngineError> {
        let gate = Arc::clone(
            self.resurrections
                .entry(stream_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = gate.lock().await;

        let mut record = self
            .checkpoint(stream_id)
            .await?
            .ok_or(ResurrectionError::NoCheckpoint { stream_id })?;

        if consumer_index >= record.consumer_count {
            return Err(ResurrectionError::ConsumerOutOfRange {
                stream_id,
                index: consumer_index,
                count: record.consumer_count,
            }
            .into());
        }
        if record.status == CheckpointStatus::Expired {
            return Err(ResurrectionError::Expired { stream_id }.into());
        }
        if age_of(&record.last_touch) > self.config.checkpoint_ttl() {
            self.expire_record(&mut record).await?;
            return Err(ResurrectionError::Expired { stream_id }.into());
        }

        let provider: &dyn WorkflowStateProvider = match (provider, self.state.as_deref()) {
            (Some(provider), _) | (None, Some(provider)) => provider,
            (None, None) => return Err(ResurrectionError::NoStateProvider { stream_id }.into()),
        };

        let Some(current) = provider.get_node(&record.source_node).await? else {
            return Err(self.node_removed(&mut record).await);
        };
        let current_inputs = provider.get_node_inputs(&record.source_node).await?;
        let report = self.validator.classify(&record, Some((&current, &current_inputs)))?;

        let (chunks, provenance) = self.recover(&mut record, &report).await?;

        record.status = CheckpointStatus::Resurrected;
        record.touch();
        save_record(
            self.records.as_ref(),
            STREAM_CHECKPOINTS,
            &stream_id.to_string(),
            &record,
        )
        .await?;

        self.report_resurrection(&record, &report, &provenance);
        Ok(StreamReader::new(
            stream_id,
            consumer_index,
            provenance,
            from_chunks(chunks),
        ))
    }

    async fn node_removed(&self, record: &mut StreamCheckpoint) -> EngineError {
        record.status = CheckpointStatus::Stale;
        if let Err(err) = save_record(
            self.records.as_ref(),
            STREAM_CHECKPOINTS,
            &record.stream_id.to_string(),
            &*record,
        )
        .await
        {
            warn!(stream_id = %record.stream_id, error = %err, "failed to mark checkpoint stale");
        }
        self.emit(
            EngineEvent::error(names::STREAM_DEGRADED)
                .with_run(record.run_id)
                .with_node(record.source_node.clone())
                .with_stream(record.stream_id)
                .with_data(json!({ "severity": StalenessSeverity::Critical })),
        );
        ResurrectionError::NodeRemoved {
            stream_id: record.stream_id,
            node_id: record.source_node.clone(),
        }
        .into()
    }

    async fn recover(
        &self,
        record: &mut StreamCheckpoint,
        report: &StalenessReport,
    ) -> Result<(Vec<Value>, Provenance), EngineError> {
        let stream_id = record.stream_id;
        let severity = report.severity;
        let cached = self.load_cached(record).await?;
        let complete = cached.is_some() && record.complete;

        if complete && record.regenerated_at.is_some() {
            let mut provenance = Provenance::regenerated(severity);
            if severity > StalenessSeverity::Fresh {
                provenance = provenance.with_warning(format!(
                    "replaying a stream regenerated from the checkpointed configuration: {}",
                    report.describe()
                ));
            }
            return Ok((cached.unwrap_or_default(), provenance));
        }

        if complete && severity <= StalenessSeverity::Minor {
            let mut provenance = Provenance::cached(severity);
            if severity == StalenessSeverity::Minor {
                provenance = provenance.with_warning(report.describe());
            }
            return Ok((cached.unwrap_or_default(), provenance));
        }

        let regenerated = match &self.invoker {
            Some(invoker) => Some(self.regenerate(record, invoker.as_ref()).await),
            None => None,
        };

        match (regenerated, cached) {
            (Some(Ok(chunks)), _) => {
                let reference = ArtifactReference::for_stream_checkpoint(&stream_id);
                put_json(self.store.as_ref(), &reference.key, &chunks, StoreHints::pinned()).await?;
                record.chunks = Some(reference);
                record.captured_chunks = chunks.len() as u64;
                record.complete = true;
                record.mode = MaterializationMode::Full;
                record.regenerated_at = Some(now_utc());

                let mut provenance = Provenance::regenerated(severity);
                if severity > StalenessSeverity::Fresh {
                    provenance = provenance.with_warning(format!(
                        "regenerated from the checkpointed configuration: {}",
                        report.describe()
                    ));
                }
                Ok((chunks, provenance))
            }
            (Some(Err(reason)), Some(chunks)) => {
                warn!(%stream_id, %reason, "regeneration failed, serving cached chunks");
                let provenance = Provenance::cached(severity)
                    .with_warning(format!("regeneration failed ({reason}); serving cached chunks"))
                    .with_warning(cache_caveat(record, report));
                Ok((chunks, provenance))
            }
            (Some(Err(reason)), None) => {
                Err(ResurrectionError::RegenerationFailed { stream_id, reason }.into())
            }
            (None, Some(chunks)) => {
                let provenance = Provenance::cached(severity)
                    .with_warning("no agent invoker available for regeneration; serving cached chunks")
                    .with_warning(cache_caveat(record, report));
                Ok((chunks, provenance))
            }
            (None, None) => Err(ResurrectionError::RegenerationUnavailable { stream_id }.into()),
        }
    }

    async fn load_cached(&self, record: &StreamCheckpoint) -> Result<Option<Vec<Value>>, EngineError> {
        let Some(reference) = &record.chunks else {
            return Ok(None);
        };
        let chunks = get_json::<Vec<Value>>(self.store.as_ref(), &reference.key).await?;
        if chunks.is_none() {
            warn!(stream_id = %record.stream_id, key = %reference.key, "checkpointed chunks are gone");
        }
        Ok(chunks)
    }

    async fn regenerate(
        &self,
        record: &StreamCheckpoint,
        invoker: &dyn AgentInvoker,
    ) -> Result<Vec<Value>, String> {
        info!(
            stream_id = %record.stream_id,
            node_id = %record.source_node,
            "regenerating stream"
        );
        let ctx = InvocationContext {
            run_id: record.run_id,
            node_id: record.source_node.clone(),
            attempt: 1,
            purpose: InvocationPurpose::Regenerate,
            cancel: CancellationToken::new(),
            effects: None,
        };
        let inputs = AgentInputs::from_values(record.input_snapshot.clone());
        let produce = regenerate_chunks(invoker, &record.node_snapshot, inputs, ctx);

        let timeout = self.config.regeneration_timeout();
        tokio::time::timeout(timeout, produce)
            .await
            .map_err(|_| format!("regeneration timed out after {}ms", timeout.as_millis()))?
    }

    fn report_resurrection(
        &self,
        record: &StreamCheckpoint,
        report: &StalenessReport,
        provenance: &Provenance,
    ) {
        info!(
            stream_id = %record.stream_id,
            node_id = %record.source_node,
            severity = ?report.severity,
            source = ?provenance.source,
            "stream resurrected"
        );
        self.emit(
            EngineEvent::new(names::STREAM_RESURRECTED)
                .with_run(record.run_id)
                .with_node(record.source_node.clone())
                .with_stream(record.stream_id)
                .with_data(json!({
                    "severity": report.severity,
                    "source": provenance.source,
                })),
        );

        if provenance.is_degraded() {
            for warning in &provenance.warnings {
                warn!(stream_id = %record.stream_id, message = %warning.message, "degraded stream");
            }
            self.emit(
                EngineEvent::warning(names::STREAM_DEGRADED)
                    .with_run(record.run_id)
                    .with_node(record.source_node.clone())
                    .with_stream(record.stream_id)
                    .with_data(json!({
                        "severity": report.severity,
                        "source": provenance.source,
                        "changed_fields": report.changed_fields,
                        "inputs_changed": report.inputs_changed,
                        "warnings": provenance.warnings,
                        "regenerated": provenance.source == ChunkSource::Regenerated,
                    })),
            );
        }
    }
}

async fn regenerate_chunks(
    invoker: &dyn AgentInvoker,
    node: &Node,
    inputs: AgentInputs,
    ctx: InvocationContext,
) -> Result<Vec<Value>, String> {
    match invoker.invoke(node, inputs, ctx).await.map_err(|err| err.message)? {
        AgentOutput::Value(value) => Ok(vec![value]),
        AgentOutput::Stream(mut stream) => {
            let mut chunks = Vec::new();
            while let Some(item) = stream.next().await {
                chunks.push(item.map_err(|fault| fault.message)?);
            }
            Ok(chunks)
        }
    }
}

fn cache_caveat(record: &StreamCheckpoint, report: &StalenessReport) -> String {
    if record.complete {
        format!("cached chunks may be stale: {}", report.describe())
    } else {
        format!(
            "cached chunks are an incomplete prefix ({} chunks): {}",
            record.captured_chunks,
            report.describe()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::ports::{
        AgentError, InMemoryArtifactStore, InMemoryRecordStore, MockWorkflowStateProvider,
        StaticStateProvider,
    };
    use async_trait::async_trait;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        manager: Arc<StreamLifecycleManager>,
        store: Arc<InMemoryArtifactStore>,
        events: Arc<CollectingEventSink>,
        provider: Arc<StaticStateProvider>,
    }

    struct Regenerator {
        chunks: Vec<Value>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentInvoker for Regenerator {
        async fn invoke(
            &self,
            _node: &Node,
            _inputs: AgentInputs,
            ctx: InvocationContext,
        ) -> Result<AgentOutput, AgentError> {
            assert_eq!(ctx.purpose, InvocationPurpose::Regenerate);
            assert!(ctx.effects.is_none());
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AgentOutput::Stream(from_chunks(self.chunks.clone())))
        }
    }

    fn writer() -> Node {
        Node::new("writer", "llm").with_config(
            crate::graph::NodeConfig::new("llm")
                .with_param("model", json!("small"))
                .with_param("temperature", json!(0.2)),
        )
    }

    fn inputs() -> HashMap<String, Value> {
        HashMap::from([("topic".to_string(), json!("rust"))])
    }

    fn fixture(config: StreamLifecycleConfig, invoker: Option<Arc<dyn AgentInvoker>>) -> Fixture {
        let store = Arc::new(InMemoryArtifactStore::unbounded());
        let events = Arc::new(CollectingEventSink::new());
        let provider = Arc::new(StaticStateProvider::new());
        provider.set_node(writer());
        provider.set_inputs("writer", inputs());

        let mut manager = StreamLifecycleManager::new(
            config,
            store.clone(),
            Arc::new(InMemoryRecordStore::new()),
            events.clone(),
        )
        .with_state_provider(provider.clone());
        if let Some(invoker) = invoker {
            manager = manager.with_invoker(invoker);
        }
        Fixture {
            manager: Arc::new(manager),
            store,
            events,
            provider,
        }
    }

    fn producer(strategy: StreamingStrategy) -> StreamProducer {
        StreamProducer {
            run_id: Uuid::nil(),
            node: writer(),
            inputs: inputs(),
            strategy,
        }
    }

    fn chunks(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!(format!("chunk-{i}"))).collect()
    }

    async fn read_all(reader: StreamReader) -> Vec<Value> {
        reader.collect_chunks().await.unwrap()
    }

    async fn checkpointed_stream(fx: &Fixture, data: Vec<Value>) -> Uuid {
        let handle = fx
            .manager
            .register(producer(StreamingStrategy::StreamSingle), from_chunks(data), 1)
            .unwrap();
        let reader = fx.manager.acquire_reader(handle.stream_id, 0).await.unwrap();
        let _ = read_all(reader).await;
        fx.manager.release_consumer(handle.stream_id, 0).await.unwrap();
        handle.stream_id
    }

    fn full_single() -> StreamLifecycleConfig {
        StreamLifecycleConfig::default().with_single_stream_mode(MaterializationMode::Full)
    }

    #[tokio::test]
    async fn test_tee_readers_see_whole_stream() {
        let fx = fixture(StreamLifecycleConfig::default(), None);
        let data = chunks(20);
        let handle = fx
            .manager
            .register(producer(StreamingStrategy::StreamTee), from_chunks(data.clone()), 3)
            .unwrap();

        let mut readers = Vec::new();
        for i in 0..3 {
            readers.push(fx.manager.acquire_reader(handle.stream_id, i).await.unwrap());
        }
        let results = futures::future::join_all(readers.into_iter().map(read_all)).await;
        for result in results {
            assert_eq!(result, data);
        }
    }

    #[tokio::test]
    async fn test_reader_cannot_be_taken_twice() {
        let fx = fixture(StreamLifecycleConfig::default(), None);
        let handle = fx
            .manager
            .register(producer(StreamingStrategy::StreamSingle), from_chunks(chunks(2)), 1)
            .unwrap();
        let _reader = fx.manager.acquire_reader(handle.stream_id, 0).await.unwrap();
        assert!(fx.manager.acquire_reader(handle.stream_id, 0).await.is_err());
        assert!(matches!(
            fx.manager.acquire_reader(handle.stream_id, 3).await,
            Err(EngineError::Resurrection(ResurrectionError::ConsumerOutOfRange { .. }))
        ));
    }

    #[tokio::test]
    async fn test_stream_slot_limit() {
        let config = StreamLifecycleConfig {
            max_active_streams: 1,
            ..StreamLifecycleConfig::default()
        };
        let fx = fixture(config, None);
        fx.manager
            .register(producer(StreamingStrategy::StreamSingle), from_chunks(chunks(1)), 1)
            .unwrap();
        let err = fx
            .manager
            .register(producer(StreamingStrategy::StreamSingle), from_chunks(chunks(1)), 1)
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_materialized_readers_replay() {
        let fx = fixture(StreamLifecycleConfig::default(), None);
        let data = chunks(5);
        let handle = fx
            .manager
            .register(producer(StreamingStrategy::StreamMaterialize), from_chunks(data.clone()), 4)
            .unwrap();
        let summary = fx.manager.materialize(handle.stream_id).await.unwrap();
        assert_eq!(summary.chunks, 5);

        for i in 0..4 {
            let reader = fx.manager.acquire_reader(handle.stream_id, i).await.unwrap();
            assert_eq!(reader.provenance().source, ChunkSource::Cache);
            assert!(!reader.provenance().is_degraded());
            assert_eq!(read_all(reader).await, data);
        }
    }

    #[tokio::test]
    async fn test_abandoned_branch_does_not_stall_tee() {
        let fx = fixture(StreamLifecycleConfig::default().with_tee_buffer_chunks(1), None);
        let data = chunks(50);
        let handle = fx
            .manager
            .register(producer(StreamingStrategy::StreamTee), from_chunks(data.clone()), 2)
            .unwrap();
        let reader = fx.manager.acquire_reader(handle.stream_id, 0).await.unwrap();
        fx.manager.abandon(handle.stream_id, 1).await.unwrap();
        assert_eq!(read_all(reader).await, data);
    }

    #[tokio::test]
    async fn test_fresh_resurrection_replays_identical_chunks() {
        let fx = fixture(full_single(), None);
        let data = chunks(8);
        let stream_id = checkpointed_stream(&fx, data.clone()).await;
        assert_eq!(fx.manager.active_count(), 0);

        let reader = fx.manager.resurrect(stream_id, 0).await.unwrap();
        assert_eq!(reader.provenance().severity, StalenessSeverity::Fresh);
        assert_eq!(reader.provenance().source, ChunkSource::Cache);
        assert!(!reader.provenance().is_degraded());
        assert_eq!(read_all(reader).await, data);
        assert!(fx.events.events_of_type(names::STREAM_DEGRADED).is_empty());
    }

    #[tokio::test]
    async fn test_minor_drift_warns_and_proceeds() {
        let fx = fixture(full_single(), None);
        let stream_id = checkpointed_stream(&fx, chunks(3)).await;
        fx.provider.set_node(writer().with_config(
            crate::graph::NodeConfig::new("llm")
                .with_param("model", json!("small"))
                .with_param("temperature", json!(0.9)),
        ));

        let reader = fx.manager.resurrect(stream_id, 0).await.unwrap();
        assert_eq!(reader.provenance().severity, StalenessSeverity::Minor);
        assert!(reader.provenance().is_degraded());
        assert_eq!(fx.events.events_of_type(names::STREAM_DEGRADED).len(), 1);
    }

    #[tokio::test]
    async fn test_major_drift_regenerates_with_snapshot() {
        let regen = Arc::new(Regenerator {
            chunks: vec![json!("regenerated")],
            calls: AtomicUsize::new(0),
        });
        let fx = fixture(full_single(), Some(regen.clone() as Arc<dyn AgentInvoker>));
        let stream_id = checkpointed_stream(&fx, chunks(3)).await;
        fx.provider.set_node(writer().with_config(
            crate::graph::NodeConfig::new("llm").with_param("model", json!("large")),
        ));

        let reader = fx.manager.resurrect(stream_id, 0).await.unwrap();
        assert_eq!(reader.provenance().severity, StalenessSeverity::Major);
        assert_eq!(reader.provenance().source, ChunkSource::Regenerated);
        assert!(reader.provenance().is_degraded());
        assert_eq!(read_all(reader).await, vec![json!("regenerated")]);

        // A second consumer replays the regenerated chunks.
        let again = fx.manager.resurrect(stream_id, 0).await.unwrap();
        assert_eq!(again.provenance().source, ChunkSource::Regenerated);
        assert_eq!(regen.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_major_drift_without_invoker_serves_cache_with_warning() {
        let fx = fixture(full_single(), None);
        let data = chunks(3);
        let stream_id = checkpointed_stream(&fx, data.clone()).await;
        fx.provider.set_inputs("writer", HashMap::from([("topic".to_string(), json!("go"))]));

        let reader = fx.manager.resurrect(stream_id, 0).await.unwrap();
        let provenance = reader.provenance().clone();
        assert_eq!(provenance.severity, StalenessSeverity::Major);
        assert_eq!(provenance.source, ChunkSource::Cache);
        assert!(provenance.warnings.len() >= 2);
        assert_eq!(read_all(reader).await, data);

        let degraded = fx.events.events_of_type(names::STREAM_DEGRADED);
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].severity, crate::events::EventSeverity::Warning);
    }

    #[tokio::test]
    async fn test_removed_node_is_hard_error() {
        let fx = fixture(full_single(), None);
        let stream_id = checkpointed_stream(&fx, chunks(2)).await;
        fx.provider.remove_node("writer");

        let err = fx.manager.resurrect(stream_id, 0).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Resurrection(ResurrectionError::NodeRemoved { .. })
        ));
        let record = fx.manager.checkpoint(stream_id).await.unwrap().unwrap();
        assert_eq!(record.status, CheckpointStatus::Stale);
    }

    #[tokio::test]
    async fn test_regenerate_mode_without_invoker_fails_loudly() {
        let fx = fixture(StreamLifecycleConfig::default(), None);
        let stream_id = checkpointed_stream(&fx, chunks(2)).await;
        let err = fx.manager.resurrect(stream_id, 0).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Resurrection(ResurrectionError::RegenerationUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_suspended_partial_stream_serves_prefix_with_warning() {
        let fx = fixture(
            StreamLifecycleConfig::default()
                .with_single_stream_mode(MaterializationMode::Partial)
                .with_partial_window_chunks(2),
            None,
        );
        let endless = stream::iter(chunks(3).into_iter().map(Ok))
            .chain(stream::pending())
            .boxed();
        let handle = fx
            .manager
            .register(producer(StreamingStrategy::StreamSingle), endless, 1)
            .unwrap();
        let mut reader = fx.manager.acquire_reader(handle.stream_id, 0).await.unwrap();
        for _ in 0..3 {
            reader.next().await.unwrap().unwrap();
        }
        drop(reader);
        fx.manager.suspend_run(Uuid::nil()).await;

        let resurrected = fx.manager.resurrect(handle.stream_id, 0).await.unwrap();
        assert!(resurrected.provenance().is_degraded());
        assert_eq!(read_all(resurrected).await, chunks(2));
    }

    #[tokio::test]
    async fn test_expired_checkpoint() {
        let fx = fixture(full_single().with_checkpoint_ttl_ms(0), None);
        let stream_id = checkpointed_stream(&fx, chunks(2)).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let expired = fx.manager.expire_stale_checkpoints().await.unwrap();
        assert_eq!(expired, vec![stream_id]);
        assert!(fx.store.is_empty());
        assert!(matches!(
            fx.manager.resurrect(stream_id, 0).await,
            Err(EngineError::Resurrection(ResurrectionError::Expired { .. }))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_due_and_now() {
        let fx = fixture(full_single().with_checkpoint_age_ms(0), None);
        let handle = fx
            .manager
            .register(producer(StreamingStrategy::StreamSingle), from_chunks(chunks(4)), 1)
            .unwrap();
        assert_eq!(fx.manager.checkpoint_due(), vec![handle.stream_id]);

        let reader = fx.manager.acquire_reader(handle.stream_id, 0).await.unwrap();
        let _ = read_all(reader).await;
        let record = fx.manager.checkpoint_now(handle.stream_id).await.unwrap();
        assert_eq!(record.status, CheckpointStatus::Checkpointed);
        assert!(record.has_complete_cache());
        assert_eq!(fx.events.events_of_type(names::STREAM_CHECKPOINTED).len(), 1);
    }

    #[tokio::test]
    async fn test_resurrection_needs_state_provider() {
        let manager = StreamLifecycleManager::new(
            full_single(),
            Arc::new(InMemoryArtifactStore::unbounded()),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(CollectingEventSink::new()),
        );
        let handle = manager
            .register(producer(StreamingStrategy::StreamSingle), from_chunks(chunks(1)), 1)
            .unwrap();
        manager.suspend(handle.stream_id).await.unwrap();
        assert!(matches!(
            manager.resurrect(handle.stream_id, 0).await,
            Err(EngineError::Resurrection(ResurrectionError::NoStateProvider { .. }))
        ));

        let mut provider = MockWorkflowStateProvider::new();
        provider.expect_get_node().returning(|_| Ok(Some(writer())));
        provider.expect_get_node_inputs().returning(|_| Ok(inputs()));
        let reader = manager
            .acquire_reader_with(handle.stream_id, 0, Some(&provider))
            .await
            .unwrap();
        assert_eq!(reader.provenance().severity, StalenessSeverity::Fresh);
    }
}
