//! Job records and the caller-facing boundary around them.
//!
//! - [`JobStore`] persists job records with optimistic locking.
//! - [`JobIntake`] turns an upload into a queued job.
//! - [`StatusService`] projects a job for callers polling its progress.

pub mod intake;
pub mod status;
mod store;

pub use intake::{ContextKind, ContextUpload, IntakeRequest, JobIntake, DEFAULT_MAX_DOCUMENT_BYTES};
pub use status::{JobStatusView, Progress, StatusService, DEFAULT_LINK_TTL};
pub use store::JobStore;
