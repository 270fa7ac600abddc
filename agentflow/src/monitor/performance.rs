//! Performance monitor.
//!
//! Recommendations are advisory. The engine only changes thresholds when the
//! caller applies them, and no threshold affects correctness.

use crate::config::MonitorConfig;
use crate::streaming::{StreamingStrategy, StreamingThresholds, ThresholdKind, ThresholdRecommendation};
use crate::utils::{now_utc, Timestamp};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// One measured node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSample {
    /// Node id.
    pub node_id: String,
    /// Agent type of the node.
    pub agent_type: String,
    /// Strategy the output was delivered with.
    pub strategy: StreamingStrategy,
    /// Sum of known resolved input sizes.
    pub input_bytes: u64,
    /// Size of the produced output.
    pub output_bytes: u64,
    /// Consumers of the output.
    pub fan_out: usize,
    /// Wall time of the successful attempt.
    pub duration_ms: u64,
    /// When the sample was taken.
    pub recorded_at: Timestamp,
}

impl ExecutionSample {
    /// Creates a sample stamped now.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        agent_type: impl Into<String>,
        strategy: StreamingStrategy,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            agent_type: agent_type.into(),
            strategy,
            input_bytes: 0,
            output_bytes: 0,
            fan_out: 0,
            duration_ms: 0,
            recorded_at: now_utc(),
        }
    }

    /// Sets the input and output sizes.
    #[must_use]
    pub fn with_sizes(mut self, input_bytes: u64, output_bytes: u64) -> Self {
        self.input_bytes = input_bytes;
        self.output_bytes = output_bytes;
        self
    }

    /// Sets the fan-out.
    #[must_use]
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Rolling window of sampled executions.
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    samples: Mutex<VecDeque<ExecutionSample>>,
    offered: AtomicU64,
}

impl PerformanceMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
            offered: AtomicU64::new(0),
        }
    }

    /// Offers a sample; it is kept with probability `sample_rate`.
    /// Returns whether it was kept.
    pub fn record(&self, sample: ExecutionSample) -> bool {
        self.offered.fetch_add(1, Ordering::Relaxed);
        let rate = self.config.sample_rate.clamp(0.0, 1.0);
        let keep = rate >= 1.0 || (rate > 0.0 && rand::thread_rng().gen_bool(rate));
        if !keep {
            return false;
        }

        let mut samples = self.samples.lock();
        samples.push_back(sample);
        while samples.len() > self.config.window.max(1) {
            samples.pop_front();
        }
        true
    }

    /// Executions offered, sampled or not.
    #[must_use]
    pub fn offered(&self) -> u64 {
        self.offered.load(Ordering::Relaxed)
    }

    /// Retained samples, oldest first.
    #[must_use]
    pub fn samples(&self) -> Vec<ExecutionSample> {
        self.samples.lock().iter().cloned().collect()
    }

    /// Number of retained samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Returns true if no sample is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Drops every sample.
    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// Threshold changes suggested by the current window.
    ///
    /// - Batch executions slower than `slow_batch_ms` suggest streaming
    ///   earlier: the large-input threshold drops to the median input size of
    ///   those executions.
    /// - Teed outputs whose median size exceeds the tee buffer budget suggest
    ///   materializing earlier: the tee threshold drops to the budget.
    #[must_use]
    pub fn recommendations(&self, thresholds: &StreamingThresholds) -> Vec<ThresholdRecommendation> {
        let samples = self.samples.lock();
        let min = self.config.min_samples.max(1);
        if samples.len() < min {
            return Vec::new();
        }

        let mut out = Vec::new();

        let slow_batch: Vec<u64> = samples
            .iter()
            .filter(|s| s.strategy == StreamingStrategy::Batch)
            .filter(|s| s.duration_ms >= self.config.slow_batch_ms && s.input_bytes > 0)
            .map(|s| s.input_bytes)
            .collect();
        if slow_batch.len() >= min {
            let target = median(slow_batch.clone());
            if target < thresholds.large_input_bytes {
                out.push(ThresholdRecommendation {
                    threshold: ThresholdKind::LargeInput,
                    current: thresholds.large_input_bytes,
                    recommended: target,
                    reason: format!(
                        "{} batch executions took over {}ms with inputs around {target} bytes",
                        slow_batch.len(),
                        self.config.slow_batch_ms
                    ),
                });
            }
        }

        let teed: Vec<u64> = samples
            .iter()
            .filter(|s| s.strategy == StreamingStrategy::StreamTee)
            .map(|s| s.output_bytes)
            .collect();
        if teed.len() >= min {
            let typical = median(teed.clone());
            let budget = self.config.tee_buffer_budget_bytes;
            if typical > budget && budget < thresholds.tee_threshold_bytes {
                out.push(ThresholdRecommendation {
                    threshold: ThresholdKind::Tee,
                    current: thresholds.tee_threshold_bytes,
                    recommended: budget,
                    reason: format!(
                        "teed outputs average {typical} bytes, above the {budget} byte buffer budget"
                    ),
                });
            }
        }

        if !out.is_empty() {
            debug!(count = out.len(), samples = samples.len(), "Threshold recommendations ready");
        }
        out
    }
}

fn median(mut values: Vec<u64>) -> u64 {
    values.sort_unstable();
    values.get(values.len() / 2).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorConfig {
            min_samples: 3,
            window: 10,
            slow_batch_ms: 1_000,
            tee_buffer_budget_bytes: 1_000,
            ..MonitorConfig::default()
        })
    }

    fn batch(input_bytes: u64, duration_ms: u64) -> ExecutionSample {
        ExecutionSample::new("n", "llm", StreamingStrategy::Batch)
            .with_sizes(input_bytes, 10)
            .with_duration_ms(duration_ms)
    }

    #[test]
    fn test_window_is_bounded() {
        let monitor = monitor();
        for i in 0..15 {
            assert!(monitor.record(batch(i, 1)));
        }
        assert_eq!(monitor.len(), 10);
        assert_eq!(monitor.offered(), 15);
        assert_eq!(monitor.samples()[0].input_bytes, 5);
    }

    #[test]
    fn test_zero_sample_rate_keeps_nothing() {
        let monitor = PerformanceMonitor::new(MonitorConfig {
            sample_rate: 0.0,
            ..MonitorConfig::default()
        });
        assert!(!monitor.record(batch(1, 1)));
        assert!(monitor.is_empty());
    }

    #[test]
    fn test_no_recommendations_below_min_samples() {
        let monitor = monitor();
        monitor.record(batch(500, 5_000));
        assert!(monitor.recommendations(&StreamingThresholds::default()).is_empty());
    }

    #[test]
    fn test_slow_batch_lowers_large_input_threshold() {
        let monitor = monitor();
        for bytes in [400, 600, 500] {
            monitor.record(batch(bytes, 2_000));
        }
        monitor.record(batch(10, 5));

        let recs = monitor.recommendations(&StreamingThresholds::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].threshold, ThresholdKind::LargeInput);
        assert_eq!(recs[0].recommended, 500);

        let tuned = StreamingThresholds::default().apply(&recs);
        assert_eq!(tuned.large_input_bytes, 500);
    }

    #[test]
    fn test_tee_pressure_lowers_tee_threshold() {
        let monitor = monitor();
        for _ in 0..3 {
            monitor.record(
                ExecutionSample::new("n", "llm", StreamingStrategy::StreamTee)
                    .with_sizes(0, 5_000)
                    .with_fan_out(3),
            );
        }

        let recs = monitor.recommendations(&StreamingThresholds::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].threshold, ThresholdKind::Tee);
        assert_eq!(recs[0].recommended, 1_000);
    }
}
