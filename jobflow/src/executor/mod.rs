//! Stage execution.
//!
//! The executor owns the contract between the engine and stage
//! collaborators: it loads dependency outputs, enforces the per-stage
//! timeout, retries transient failures, and writes the checkpoint. A
//! collaborator only ever reports success, a retryable failure, or a fatal
//! failure.

mod collaborator;
#[cfg(feature = "remote")]
mod http;
mod registry;
mod stage_executor;

#[cfg(test)]
pub use collaborator::MockStageCollaborator;
pub use collaborator::{DependencyInput, StageCollaborator, StageOutcome, StageRequest};
#[cfg(feature = "remote")]
pub use http::HttpCollaborator;
pub use registry::{RegisteredStage, StageDefinition, StageRegistry, DEFAULT_STAGE_TIMEOUT};
pub use stage_executor::{StageCompletion, StageExecutor, StageResult};
