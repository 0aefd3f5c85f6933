//! Testing utilities for jobflow engines.
//!
//! This module provides:
//! - Scripted stage collaborators
//! - A storage wrapper that injects write faults
//! - A harness wiring the engine over in-memory backends
//! - Assertions over job records and checkpoints

mod assertions;
mod collaborators;
mod faults;
mod fixtures;

pub use assertions::{assert_job_completed, assert_one_checkpoint_per_stage, assert_progress_is_prefix};
pub use collaborators::ScriptedCollaborator;
pub use faults::FaultyStorage;
pub use fixtures::{fast_retry, TestHarness};
