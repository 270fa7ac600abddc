//! Execution snapshots and rollback to them.
//!
//! A snapshot pairs the node-state map with the ledger cursor at the time it
//! was taken. Restoring compensates (or lists, for manual review) every effect
//! the run recorded after that cursor.

mod manager;

pub use manager::{CheckpointManager, CompensationStrategy, ExecutionSnapshot, RestoreResult};
