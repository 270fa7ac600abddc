//! Side-effect ledger and compensation.
//!
//! Agents record externally visible operations through an
//! [`EffectRecorder`]; rollback walks them newest-first and dispatches each
//! through the [`CompensationRegistry`].

mod entry;
mod journal;
mod recorder;
mod registry;
mod store;

pub use entry::{
    CompensationDescriptor, CompensationReport, CompensationResult, EffectStatus, SideEffect,
    SideEffectEntry,
};
pub use journal::LedgerJournal;
pub use recorder::EffectRecorder;
#[cfg(test)]
pub use registry::MockCompensationHandler;
pub use registry::{
    CompensationHandler, CompensationRegistry, FnCompensationHandler, HandlerOutcome, MatchRule,
};
pub use store::SideEffectLedger;
