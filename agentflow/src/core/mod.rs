//! Core value types shared across the engine.

mod artifact;
mod status;

pub use artifact::ArtifactReference;
pub use status::NodeStatus;
