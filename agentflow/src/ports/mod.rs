//! Interfaces to external collaborators and bundled implementations.

mod agent;
mod artifact_store;
mod record_store;
mod state_provider;

pub use agent::{
    AgentError, AgentInputs, AgentInvoker, AgentOutput, InputValue, InvocationContext,
    InvocationPurpose,
};
pub use artifact_store::{
    get_json, put_json, ArtifactStore, FsArtifactStore, InMemoryArtifactStore, StoreHints,
};
pub use record_store::{
    load_record, save_record, FileRecordStore, InMemoryRecordStore, RecordStore,
    EXECUTION_SNAPSHOTS, STREAM_CHECKPOINTS,
};
pub use state_provider::{StaticStateProvider, WorkflowStateProvider};

#[cfg(test)]
pub use state_provider::MockWorkflowStateProvider;
