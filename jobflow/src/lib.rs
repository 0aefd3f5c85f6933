//! # Jobflow
//!
//! Durable, resumable processing of long-running document jobs.
//!
//! A job is routed once to a frozen, ordered stage plan. Workers pick jobs
//! off an at-least-once queue and walk the plan; every stage output is
//! written as an immutable checkpoint before the job record advances, so a
//! worker that dies mid-job loses at most the stage it was running.
//!
//! - **Routing**: named pipelines are data, consulted only by the router
//! - **Checkpoints**: content-addressed, versioned per job generation
//! - **Optimistic locking**: one conditional write per transition; losers back off
//! - **Recovery**: resume from `stages_completed`, replay checkpointed stages
//! - **Dead letters**: jobs that exhaust redelivery are failed with a diagnosis
//! - **Leases**: a live run's claim turns duplicate deliveries into no-ops
//! - **Metrics**: stage and run durations and outcomes, exported via Prometheus
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jobflow::prelude::*;
//!
//! let storage = storage::connect(&StorageConfig::Memory).await?;
//! let registry = StageRegistry::new()
//!     .with_stage(StageDefinition::new("extract"), Arc::new(Extractor))
//!     .with_stage(StageDefinition::new("generate"), Arc::new(Generator));
//! let executor = StageExecutor::new(Arc::new(registry), CheckpointStore::new(storage.clone()));
//! let orchestrator = Orchestrator::new(JobStore::new(storage), executor);
//!
//! match orchestrator.run(&job_key).await? {
//!     RunOutcome::Completed => println!("done"),
//!     other => println!("not finished: {other:?}"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod jobs;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod utils;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{CheckpointStore, CheckpointWrite};
    pub use crate::config::JobflowConfig;
    pub use crate::core::{BlobRef, Checkpoint, Job, JobInput, JobKey, JobStatus};
    pub use crate::errors::{FailureClass, JobFailure, JobflowError, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{
        StageCollaborator, StageDefinition, StageExecutor, StageOutcome, StageRegistry, StageRequest,
    };
    pub use crate::jobs::{IntakeRequest, JobIntake, JobStore, StatusService};
    pub use crate::observability::{Metrics, NoOpMetrics, PrometheusMetrics};
    pub use crate::orchestrator::{LeaseConfig, Orchestrator, RunOutcome};
    pub use crate::pipeline::{PipelineCatalog, PipelineRouter, RetryConfig};
    pub use crate::queue::{InMemoryJobQueue, JobMessage, JobQueue};
    pub use crate::storage::{self, Storage, StorageConfig};
    pub use crate::worker::{Worker, WorkerPool};
}
