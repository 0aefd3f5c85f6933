//! Read-only projection of a job for callers.
//!
//! The view exposes lifecycle status, progress and artifacts. Retry counts,
//! lock tokens, generations and checkpoint versions stay internal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::JobStore;
use crate::core::{Job, JobKey, JobStatus};
use crate::errors::{JobFailure, NotFoundError, Result};
use crate::storage::Storage;

/// Default lifetime of artifact retrieval links.
pub const DEFAULT_LINK_TTL: Duration = Duration::from_secs(3_600);

/// Progress is capped here until the job actually completes.
const PROCESSING_CAP: u8 = 90;

fn step_label(stage: &str) -> String {
    match stage {
        "pdf_processing" => "Processing PDF".to_string(),
        "context_processing" => "Processing context".to_string(),
        "drawing_analysis" | "component_extraction" => "Extracting components".to_string(),
        "excel_generation" => "Generating Excel file".to_string(),
        "evaluation" => "Running quality evaluation".to_string(),
        other => format!("Processing ({other})"),
    }
}

/// Coarse progress indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// 0 to 100.
    pub percentage: u8,
    /// Human-readable step.
    pub current_step: String,
    /// Rough remaining time, for non-terminal jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining_seconds: Option<u64>,
}

impl Progress {
    /// Computes progress for `job`.
    #[must_use]
    pub fn of(job: &Job) -> Self {
        let completed = job.stages_completed.len();
        match job.status {
            JobStatus::Queued => Self {
                percentage: 0,
                current_step: "Waiting in queue".to_string(),
                estimated_time_remaining_seconds: Some(300),
            },
            JobStatus::Processing => {
                let total = job.stage_plan.len().max(1);
                let raw = completed * 100 / total;
                let percentage = u8::try_from(raw).unwrap_or(100).min(PROCESSING_CAP);
                let current_step = job
                    .current_stage
                    .as_deref()
                    .map_or_else(|| "Processing".to_string(), step_label);
                let remaining = 300u64.saturating_sub(completed as u64 * 60).max(30);
                Self {
                    percentage,
                    current_step,
                    estimated_time_remaining_seconds: Some(remaining),
                }
            }
            JobStatus::Completed => Self {
                percentage: 100,
                current_step: "Completed".to_string(),
                estimated_time_remaining_seconds: None,
            },
            JobStatus::Failed => Self {
                percentage: 0,
                current_step: "Failed".to_string(),
                estimated_time_remaining_seconds: None,
            },
        }
    }
}

/// What a caller sees when polling a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    /// Job identifier.
    pub job_id: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Pipeline the job runs.
    pub pipeline: String,
    /// Stages done so far.
    pub stages_completed: Vec<String>,
    /// Stage in progress, or the stage that failed.
    pub current_stage: Option<String>,
    /// Progress indicator.
    pub progress: Progress,
    /// Artifact names to storage references.
    pub output_refs: BTreeMap<String, String>,
    /// Failure, if the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    /// Creation time.
    pub created_at: String,
    /// Last change.
    pub updated_at: String,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.key.job_id.clone(),
            status: job.status,
            pipeline: job.pipeline.clone(),
            stages_completed: job.stages_completed.clone(),
            current_stage: job.current_stage.clone(),
            progress: Progress::of(job),
            output_refs: job
                .output_refs
                .iter()
                .map(|(name, blob)| (name.clone(), blob.to_string()))
                .collect(),
            error: job.error.clone(),
            created_at: job.created_at.clone(),
            updated_at: job.updated_at.clone(),
        }
    }
}

/// Answers status and artifact queries.
#[derive(Clone)]
pub struct StatusService {
    jobs: JobStore,
    storage: Arc<dyn Storage>,
    link_ttl: Duration,
}

impl std::fmt::Debug for StatusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusService")
            .field("backend", &self.storage.backend_name())
            .field("link_ttl", &self.link_ttl)
            .finish()
    }
}

impl StatusService {
    /// Creates a service over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            jobs: JobStore::new(storage.clone()),
            storage,
            link_ttl: DEFAULT_LINK_TTL,
        }
    }

    /// Sets how long retrieval links stay valid.
    #[must_use]
    pub fn with_link_ttl(mut self, ttl: Duration) -> Self {
        self.link_ttl = ttl;
        self
    }

    /// Current view of one job.
    pub async fn status(&self, key: &JobKey) -> Result<JobStatusView> {
        let job = self.jobs.get(key).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Most recent jobs of one `tenant#client` owner.
    pub async fn list_for_owner(&self, owner: &str, limit: usize) -> Result<Vec<JobStatusView>> {
        let jobs = self.jobs.list_by_owner(owner, Some(limit)).await?;
        Ok(jobs.iter().map(JobStatusView::from).collect())
    }

    /// Time-limited link to one artifact of a job.
    pub async fn artifact_url(&self, key: &JobKey, artifact: &str) -> Result<String> {
        let job = self.jobs.get(key).await?;
        let blob = job
            .output_refs
            .get(artifact)
            .ok_or_else(|| NotFoundError::new(format!("artifact '{artifact}' of job {key}")))?;
        self.storage.retrieval_url(blob, self.link_ttl).await
    }
}
