//! Engine configuration.
//!
//! Every field has a serde default, so a partial JSON document (or none at
//! all) yields a usable configuration. `AGENTFLOW_*` environment variables
//! override individual fields after loading.

use crate::errors::{ConfigError, EngineError};
use crate::scheduler::policy::FailurePolicy;
use crate::streaming::{MaterializationMode, StreamingThresholds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduling and failure handling.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Streaming strategy thresholds.
    #[serde(default)]
    pub streaming: StreamingThresholds,
    /// Stream tee, checkpoint and resurrection settings.
    #[serde(default)]
    pub streams: StreamLifecycleConfig,
    /// Execution snapshot cadence.
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    /// Side-effect ledger settings.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Performance sampling.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Artifact placement.
    #[serde(default)]
    pub artifacts: ArtifactConfig,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Size of the execution slot pool.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Timeout for nodes without their own, in milliseconds.
    #[serde(default = "default_node_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Failure policy for runs that do not specify one.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_node_timeout_ms() -> u64 {
    300_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_ms: default_node_timeout_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Default node timeout as a duration.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Stream lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamLifecycleConfig {
    /// Chunks buffered per tee branch before the producer waits.
    #[serde(default = "default_tee_buffer_chunks")]
    pub tee_buffer_chunks: usize,
    /// Maximum concurrently registered streams.
    #[serde(default = "default_max_active_streams")]
    pub max_active_streams: usize,
    /// Streams older than this are eligible for checkpointing.
    #[serde(default = "default_checkpoint_age_ms")]
    pub checkpoint_age_ms: u64,
    /// Period of the background checkpoint loop.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// Chunks retained for `partial` checkpoints.
    #[serde(default = "default_partial_window")]
    pub partial_window_chunks: usize,
    /// Checkpoints untouched for longer than this expire.
    #[serde(default = "default_checkpoint_ttl_ms")]
    pub checkpoint_ttl_ms: u64,
    /// Materialization mode for single-consumer streams.
    #[serde(default = "default_single_stream_mode")]
    pub single_stream_mode: MaterializationMode,
    /// Timeout for regenerating a stale stream.
    #[serde(default = "default_regeneration_timeout_ms")]
    pub regeneration_timeout_ms: u64,
    /// Config paths (`agent_type`, `params.model`, ...) whose change makes a
    /// checkpoint majorly stale.
    #[serde(default = "default_critical_fields")]
    pub critical_fields: Vec<String>,
}

fn default_tee_buffer_chunks() -> usize {
    64
}

fn default_max_active_streams() -> usize {
    256
}

fn default_checkpoint_age_ms() -> u64 {
    30_000
}

fn default_checkpoint_interval_ms() -> u64 {
    10_000
}

fn default_partial_window() -> usize {
    1024
}

fn default_checkpoint_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_single_stream_mode() -> MaterializationMode {
    MaterializationMode::Regenerate
}

fn default_regeneration_timeout_ms() -> u64 {
    120_000
}

fn default_critical_fields() -> Vec<String> {
    ["agent_type", "params.model", "params.prompt", "params.system_prompt"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for StreamLifecycleConfig {
    fn default() -> Self {
        Self {
            tee_buffer_chunks: default_tee_buffer_chunks(),
            max_active_streams: default_max_active_streams(),
            checkpoint_age_ms: default_checkpoint_age_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            partial_window_chunks: default_partial_window(),
            checkpoint_ttl_ms: default_checkpoint_ttl_ms(),
            single_stream_mode: default_single_stream_mode(),
            regeneration_timeout_ms: default_regeneration_timeout_ms(),
            critical_fields: default_critical_fields(),
        }
    }
}

impl StreamLifecycleConfig {
    /// Sets the tee buffer size.
    #[must_use]
    pub fn with_tee_buffer_chunks(mut self, chunks: usize) -> Self {
        self.tee_buffer_chunks = chunks;
        self
    }

    /// Sets the checkpoint age threshold.
    #[must_use]
    pub fn with_checkpoint_age_ms(mut self, ms: u64) -> Self {
        self.checkpoint_age_ms = ms;
        self
    }

    /// Sets the checkpoint TTL.
    #[must_use]
    pub fn with_checkpoint_ttl_ms(mut self, ms: u64) -> Self {
        self.checkpoint_ttl_ms = ms;
        self
    }

    /// Sets the partial window size.
    #[must_use]
    pub fn with_partial_window_chunks(mut self, chunks: usize) -> Self {
        self.partial_window_chunks = chunks;
        self
    }

    /// Sets the mode used for single-consumer streams.
    #[must_use]
    pub fn with_single_stream_mode(mut self, mode: MaterializationMode) -> Self {
        self.single_stream_mode = mode;
        self
    }

    /// Checkpoint age threshold as a duration.
    #[must_use]
    pub fn checkpoint_age(&self) -> Duration {
        Duration::from_millis(self.checkpoint_age_ms)
    }

    /// Checkpoint loop period as a duration.
    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// Checkpoint TTL as a duration.
    #[must_use]
    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_millis(self.checkpoint_ttl_ms)
    }

    /// Regeneration timeout as a duration.
    #[must_use]
    pub fn regeneration_timeout(&self) -> Duration {
        Duration::from_millis(self.regeneration_timeout_ms)
    }
}

/// Execution snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Snapshot after every N completed levels. `None` disables periodic
    /// snapshots; triggered snapshots are still available.
    #[serde(default = "default_snapshot_every_levels")]
    pub snapshot_every_levels: Option<usize>,
    /// Snapshots retained per run; older ones are pruned.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

#[allow(clippy::unnecessary_wraps)]
fn default_snapshot_every_levels() -> Option<usize> {
    Some(1)
}

fn default_max_snapshots() -> usize {
    10
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            snapshot_every_levels: default_snapshot_every_levels(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

/// Side-effect ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-lines journal path. `None` keeps the ledger in memory.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    /// Timeout for a single compensation handler call.
    #[serde(default = "default_compensation_timeout_ms")]
    pub compensation_timeout_ms: u64,
}

fn default_compensation_timeout_ms() -> u64 {
    30_000
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            compensation_timeout_ms: default_compensation_timeout_ms(),
        }
    }
}

impl LedgerConfig {
    /// Compensation timeout as a duration.
    #[must_use]
    pub fn compensation_timeout(&self) -> Duration {
        Duration::from_millis(self.compensation_timeout_ms)
    }
}

/// Performance monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Fraction of node executions sampled, in `[0, 1]`.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Samples retained in the rolling window.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Samples required before recommendations are made.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Batch executions slower than this are considered slow.
    #[serde(default = "default_slow_batch_ms")]
    pub slow_batch_ms: u64,
    /// Bytes a single tee is expected to buffer comfortably.
    #[serde(default = "default_tee_buffer_budget")]
    pub tee_buffer_budget_bytes: u64,
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_window() -> usize {
    1000
}

fn default_min_samples() -> usize {
    5
}

fn default_slow_batch_ms() -> u64 {
    5_000
}

fn default_tee_buffer_budget() -> u64 {
    4 * 1024 * 1024
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            window: default_window(),
            min_samples: default_min_samples(),
            slow_batch_ms: default_slow_batch_ms(),
            tee_buffer_budget_bytes: default_tee_buffer_budget(),
        }
    }
}

/// Artifact placement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Batch outputs larger than this are stored as artifacts and referenced.
    #[serde(default = "default_inline_output_limit")]
    pub inline_output_limit_bytes: usize,
    /// Capacity of the default in-memory store.
    #[serde(default = "default_store_capacity")]
    pub store_capacity_bytes: u64,
}

fn default_inline_output_limit() -> usize {
    256 * 1024
}

fn default_store_capacity() -> u64 {
    512 * 1024 * 1024
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            inline_output_limit_bytes: default_inline_output_limit(),
            store_capacity_bytes: default_store_capacity(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON file, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_max_concurrency(mut self, slots: usize) -> Self {
        self.scheduler.max_concurrency = slots;
        self
    }

    /// Sets the default node timeout.
    #[must_use]
    pub fn with_default_timeout_ms(mut self, ms: u64) -> Self {
        self.scheduler.default_timeout_ms = ms;
        self
    }

    /// Sets the default failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.scheduler.failure_policy = policy;
        self
    }

    /// Sets the streaming thresholds.
    #[must_use]
    pub fn with_streaming(mut self, thresholds: StreamingThresholds) -> Self {
        self.streaming = thresholds;
        self
    }

    /// Sets the stream lifecycle settings.
    #[must_use]
    pub fn with_streams(mut self, streams: StreamLifecycleConfig) -> Self {
        self.streams = streams;
        self
    }

    /// Sets the snapshot settings.
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: CheckpointConfig) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Sets the ledger settings.
    #[must_use]
    pub fn with_ledger(mut self, ledger: LedgerConfig) -> Self {
        self.ledger = ledger;
        self
    }

    /// Sets the monitor settings.
    #[must_use]
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the artifact settings.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: ArtifactConfig) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Applies `AGENTFLOW_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value does not parse.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::new(key, format!("cannot parse '{raw}'")))
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(raw) = lookup($key) {
                    $field = parse($key, &raw)?;
                }
            };
        }

        override_field!("AGENTFLOW_MAX_CONCURRENCY", self.scheduler.max_concurrency);
        override_field!("AGENTFLOW_NODE_TIMEOUT_MS", self.scheduler.default_timeout_ms);
        override_field!("AGENTFLOW_LARGE_INPUT_BYTES", self.streaming.large_input_bytes);
        override_field!("AGENTFLOW_TEE_THRESHOLD_BYTES", self.streaming.tee_threshold_bytes);
        override_field!("AGENTFLOW_MAX_TEE_CONSUMERS", self.streaming.max_tee_consumers);
        override_field!("AGENTFLOW_TEE_BUFFER_CHUNKS", self.streams.tee_buffer_chunks);
        override_field!("AGENTFLOW_MAX_ACTIVE_STREAMS", self.streams.max_active_streams);
        override_field!("AGENTFLOW_CHECKPOINT_AGE_MS", self.streams.checkpoint_age_ms);
        override_field!("AGENTFLOW_CHECKPOINT_TTL_MS", self.streams.checkpoint_ttl_ms);
        override_field!("AGENTFLOW_MONITOR_SAMPLE_RATE", self.monitor.sample_rate);

        if let Some(raw) = lookup("AGENTFLOW_LEDGER_JOURNAL") {
            self.ledger.journal_path = if raw.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(raw))
            };
        }

        Ok(())
    }

    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::new("scheduler.max_concurrency", "must be at least 1"));
        }
        if self.scheduler.default_timeout_ms == 0 {
            return Err(ConfigError::new("scheduler.default_timeout_ms", "must be positive"));
        }
        if self.streaming.max_tee_consumers < 2 {
            return Err(ConfigError::new("streaming.max_tee_consumers", "must be at least 2"));
        }
        if self.streams.tee_buffer_chunks == 0 {
            return Err(ConfigError::new("streams.tee_buffer_chunks", "must be at least 1"));
        }
        if self.streams.max_active_streams == 0 {
            return Err(ConfigError::new("streams.max_active_streams", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.monitor.sample_rate) {
            return Err(ConfigError::new("monitor.sample_rate", "must be within [0, 1]"));
        }
        if self.checkpoints.snapshot_every_levels == Some(0) {
            return Err(ConfigError::new(
                "checkpoints.snapshot_every_levels",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}
