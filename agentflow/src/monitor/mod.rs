//! Sampled execution measurements and advisory threshold tuning.

mod performance;

pub use performance::{ExecutionSample, PerformanceMonitor};
