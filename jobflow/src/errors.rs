//! Error types for the jobflow engine.
//!
//! The taxonomy separates errors that end a job (`ValidationError`,
//! `FatalStageError`) from errors that are resolved internally
//! (`TransientProviderError`, `ConflictError`, `DuplicateCheckpointError`).
//! Only the first group reaches callers: validation errors are returned by
//! intake before a record exists, and fatal stage errors are written into the
//! job record as a [`JobFailure`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::Checkpoint;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, JobflowError>;

/// The main error type for jobflow operations.
#[derive(Debug, Error)]
pub enum JobflowError {
    /// Input failed validation before any work started.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A stage failed in a way that retrying will not fix.
    #[error("{0}")]
    FatalStage(#[from] FatalStageError),

    /// A provider failed transiently and retrying may succeed.
    #[error("{0}")]
    TransientProvider(#[from] TransientProviderError),

    /// A conditional write lost against a concurrent writer.
    #[error("{0}")]
    Conflict(#[from] ConflictError),

    /// A checkpoint version was already written.
    #[error("{0}")]
    DuplicateCheckpoint(#[from] Box<DuplicateCheckpointError>),

    /// A record or blob does not exist.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// A job mutation would break the lifecycle rules.
    #[error("{0}")]
    IllegalTransition(#[from] IllegalTransitionError),

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobflowError {
    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true when the error means "someone else got there first".
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true for missing records or blobs.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Short machine-readable name of the error class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::FatalStage(_) => "fatal_stage",
            Self::TransientProvider(_) => "transient_provider",
            Self::Conflict(_) => "conflict",
            Self::DuplicateCheckpoint(_) => "duplicate_checkpoint",
            Self::NotFound(_) => "not_found",
            Self::IllegalTransition(_) => "illegal_transition",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for JobflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<DuplicateCheckpointError> for JobflowError {
    fn from(err: DuplicateCheckpointError) -> Self {
        Self::DuplicateCheckpoint(Box::new(err))
    }
}

/// Error raised when job input is malformed.
#[derive(Debug, Clone, Error)]
#[error("Validation failed for '{field}': {message}")]
pub struct ValidationError {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error raised by a provider call that may succeed on retry.
#[derive(Debug, Clone, Error)]
#[error("Transient provider error in stage '{stage}': {reason}")]
pub struct TransientProviderError {
    /// The stage that observed the error.
    pub stage: String,
    /// Provider-supplied reason.
    pub reason: String,
}

impl TransientProviderError {
    /// Creates a new transient provider error.
    #[must_use]
    pub fn new(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

/// Why a stage failure is considered fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The collaborator reported an unrecoverable error.
    Unrecoverable,
    /// Transient failures persisted past the retry budget.
    RetriesExhausted,
    /// The stage is not registered with the executor.
    UnknownStage,
    /// The stage would break checkpoint ordering.
    OrderingViolation,
    /// The queue gave up redelivering the job.
    DeadLettered,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unrecoverable => write!(f, "unrecoverable"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::UnknownStage => write!(f, "unknown_stage"),
            Self::OrderingViolation => write!(f, "ordering_violation"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

/// Error raised when a stage cannot complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' failed ({class}): {reason}")]
pub struct FatalStageError {
    /// The failed stage.
    pub stage: String,
    /// Failure classification.
    pub class: FailureClass,
    /// Human-readable reason.
    pub reason: String,
}

impl FatalStageError {
    /// Creates a new fatal stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, class: FailureClass, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            class,
            reason: reason.into(),
        }
    }
}

/// Error raised when a conditional write observes an unexpected prior value.
#[derive(Debug, Clone, Error)]
#[error("Conditional write conflict on {table}/{key}: {message}")]
pub struct ConflictError {
    /// Logical table.
    pub table: String,
    /// Record key.
    pub key: String,
    /// What did not match.
    pub message: String,
}

impl ConflictError {
    /// Creates a new conflict error.
    #[must_use]
    pub fn new(table: impl Into<String>, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Error raised when the checkpoint version being written already exists.
///
/// Carries the stored checkpoint so callers can treat the replay as success.
#[derive(Debug, Clone, Error)]
#[error("Checkpoint {job_id}/{stage}/v{version} already exists")]
pub struct DuplicateCheckpointError {
    /// Job identifier.
    pub job_id: String,
    /// Stage name.
    pub stage: String,
    /// Colliding version.
    pub version: u32,
    /// The checkpoint that won.
    pub existing: Option<Checkpoint>,
}

/// Error raised when a record or blob is absent.
#[derive(Debug, Clone, Error)]
#[error("Not found: {what}")]
pub struct NotFoundError {
    /// Description of the missing item.
    pub what: String,
}

impl NotFoundError {
    /// Creates a new not-found error.
    #[must_use]
    pub fn new(what: impl Into<String>) -> Self {
        Self { what: what.into() }
    }
}

/// Error raised when a job mutation violates the lifecycle rules.
#[derive(Debug, Clone, Error)]
#[error("Illegal transition for job '{job}': {message}")]
pub struct IllegalTransitionError {
    /// Composite job key.
    pub job: String,
    /// What was attempted.
    pub message: String,
}

impl IllegalTransitionError {
    /// Creates a new illegal transition error.
    #[must_use]
    pub fn new(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            message: message.into(),
        }
    }
}

/// Structured failure stored on a job record.
///
/// This is the only error shape callers see through the status boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stage that failed, if any (a job dead-lettered while queued has none).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Failure classification.
    pub class: FailureClass,
    /// Human-readable reason.
    pub reason: String,
    /// When the failure was recorded (RFC 3339).
    pub timestamp: String,
    /// Extra diagnostics (dead-letter analysis and similar).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl JobFailure {
    /// Builds a failure record from a fatal stage error.
    #[must_use]
    pub fn from_stage_error(err: &FatalStageError) -> Self {
        Self {
            stage: Some(err.stage.clone()),
            class: err.class,
            reason: err.reason.clone(),
            timestamp: crate::utils::iso_timestamp(),
            details: HashMap::new(),
        }
    }

    /// Adds a diagnostic entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}
