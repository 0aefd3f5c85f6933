//! Queue-driven workers.
//!
//! Each worker takes one message at a time, runs the job through the
//! [`Orchestrator`](crate::orchestrator::Orchestrator) and settles the
//! message according to the outcome:
//!
//! | Outcome | Message |
//! |---------|---------|
//! | completed, failed, already terminal, missing | acked |
//! | yielded | released |
//! | abandoned, error | left in flight until the visibility timeout |

mod pool;
mod shutdown;

pub use pool::{Disposition, MaintenanceReport, Worker, WorkerPool};
pub use shutdown::ShutdownToken;
