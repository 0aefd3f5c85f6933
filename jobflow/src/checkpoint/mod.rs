//! Checkpoint persistence.
//!
//! A checkpoint is the durable output of one stage for one job. Checkpoints
//! are immutable; re-executing a stage in a later job generation writes a
//! new version and the highest version is authoritative.

mod store;

pub use store::{CheckpointStore, CheckpointWrite, DEFAULT_CHECKPOINT_RETENTION_DAYS};
