//! Where a picked-up job continues, and finding jobs nobody is working on.

use chrono::Duration as ChronoDuration;
use std::time::Duration;

use crate::core::{Job, JobStatus};
use crate::errors::Result;
use crate::jobs::JobStore;
use crate::queue::{JobMessage, JobQueue};
use crate::utils::{now_utc, parse_timestamp};

/// Where execution continues for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing to do: the job is terminal or has no stage left.
    Finished,
    /// A queued job starts at its first planned stage.
    Start(String),
    /// A processing job continues at its current stage.
    Resume {
        /// Stage to run next.
        stage: String,
        /// Stages already completed, which are never re-run.
        completed: usize,
    },
}

/// Determines resume points and finds stalled jobs.
#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    jobs: JobStore,
}

impl RecoveryCoordinator {
    /// Creates a coordinator over `jobs`.
    #[must_use]
    pub fn new(jobs: JobStore) -> Self {
        Self { jobs }
    }

    /// Where `job` continues.
    ///
    /// Only the job record is consulted: `stages_completed` is the source of
    /// truth for progress. A checkpoint written after the last job update is
    /// picked up by the executor without invoking the stage again.
    #[must_use]
    pub fn resume_point(job: &Job) -> ResumePoint {
        if job.is_terminal() {
            return ResumePoint::Finished;
        }
        match (job.status, job.next_stage()) {
            (_, None) => ResumePoint::Finished,
            (JobStatus::Queued, Some(stage)) => ResumePoint::Start(stage.to_string()),
            (_, Some(stage)) => ResumePoint::Resume {
                stage: stage.to_string(),
                completed: job.stages_completed.len(),
            },
        }
    }

    /// `processing` jobs not updated for `older_than` and not under a live
    /// lease.
    ///
    /// These are jobs whose worker died and whose message was lost or has
    /// not been redelivered yet.
    pub async fn find_stalled(&self, older_than: Duration) -> Result<Vec<Job>> {
        let threshold = ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let now = now_utc();
        let cutoff = now - threshold;
        let processing = self.jobs.list_by_status(JobStatus::Processing, None).await?;
        Ok(processing
            .into_iter()
            .filter(|job| !job.lease.as_ref().is_some_and(|lease| lease.is_live(&now)))
            .filter(|job| match parse_timestamp(&job.updated_at) {
                Ok(updated) => updated < cutoff,
                Err(err) => {
                    tracing::warn!(job_key = %job.key, error = %err, "Unparseable updated_at");
                    false
                }
            })
            .collect())
    }

    /// Re-enqueues every stalled job; returns how many were enqueued.
    pub async fn requeue_stalled(&self, older_than: Duration, queue: &dyn JobQueue) -> Result<usize> {
        let stalled = self.find_stalled(older_than).await?;
        for job in &stalled {
            tracing::warn!(
                job_key = %job.key,
                current_stage = job.current_stage.as_deref().unwrap_or("-"),
                updated_at = %job.updated_at,
                "Re-enqueueing stalled job"
            );
            queue.enqueue(JobMessage::for_job(&job.key)).await?;
        }
        Ok(stalled.len())
    }
}
