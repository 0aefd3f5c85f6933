//! Core domain model types for jobflow.
//!
//! This module contains the records shared by every component:
//! - Job identity, inputs and the lifecycle record
//! - Checkpoint records
//! - Audit events and the status enums

mod checkpoint;
mod event;
mod job;
mod status;

pub use checkpoint::Checkpoint;
pub use event::{ProcessingEvent, DEFAULT_EVENT_RETENTION_DAYS};
pub use job::{BlobRef, Job, JobInput, JobKey, JobLease, KEY_SEPARATOR};
pub use status::{JobStatus, ProcessingEventType};
