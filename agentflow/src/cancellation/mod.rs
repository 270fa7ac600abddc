//! Cooperative cancellation for runs.
//!
//! One token is shared by every in-flight node execution and open stream
//! reader of a run.

mod token;

pub use token::{CancelCallback, CancellationToken};
