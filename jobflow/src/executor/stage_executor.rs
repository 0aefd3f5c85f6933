//! Runs one stage of one job and turns the outcome into a checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;

use super::{DependencyInput, RegisteredStage, StageOutcome, StageRegistry, StageRequest};
use crate::checkpoint::{CheckpointStore, CheckpointWrite};
use crate::core::{BlobRef, Checkpoint, Job};
use crate::errors::{FailureClass, FatalStageError, JobflowError, Result};
use crate::pipeline::{should_retry, RetryConfig, RetryDecision, RetryState};

/// A stage whose output is durably checkpointed.
#[derive(Debug, Clone, PartialEq)]
pub struct StageCompletion {
    /// Stage name.
    pub stage: String,
    /// Authoritative checkpoint for this generation.
    pub checkpoint: Checkpoint,
    /// Collaborator invocations made by this execution (0 on replay).
    pub attempts: u32,
    /// Wall time spent in this execution.
    pub duration_ms: f64,
    /// True if the checkpoint was written by an earlier execution.
    pub replayed: bool,
}

impl StageCompletion {
    /// Artifacts recorded with the checkpoint.
    #[must_use]
    pub fn output_refs(&self) -> &BTreeMap<String, BlobRef> {
        &self.checkpoint.output_refs
    }
}

/// Result of executing a stage.
///
/// Infrastructure failures (storage errors, lost races on the job record)
/// are returned as `Err` instead, since they say nothing about the stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    /// The stage output is checkpointed.
    Completed(StageCompletion),
    /// The stage cannot succeed; the job should fail.
    Failed(FatalStageError),
}

/// Invokes collaborators with retries and persists their output.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    registry: Arc<StageRegistry>,
    checkpoints: CheckpointStore,
    retry: RetryConfig,
}

impl StageExecutor {
    /// Creates an executor with the default retry budget.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>, checkpoints: CheckpointStore) -> Self {
        Self {
            registry,
            checkpoints,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the retry budget for stages without their own.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The stages this executor can run.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// The checkpoint store outputs are written to.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Executes `stage` for `job` and checkpoints the output.
    ///
    /// If this generation already has a checkpoint for the stage, the
    /// collaborator is not invoked and the stored checkpoint is returned.
    /// A checkpoint that appears concurrently is also treated as success.
    pub async fn execute(&self, job: &Job, stage: &str) -> Result<StageResult> {
        let started = Instant::now();
        let job_id = job.key.job_id.as_str();

        let Some(registered) = self.registry.get(stage) else {
            return Ok(fatal(stage, FailureClass::UnknownStage, "stage is not registered"));
        };
        if !job.stage_plan.iter().any(|s| s == stage) {
            return Ok(fatal(stage, FailureClass::OrderingViolation, "stage is not in the job's plan"));
        }
        if let Some(prev) = job.predecessor_of(stage) {
            match self.checkpoints.find_latest(job_id, prev).await? {
                Some(cp) if cp.generation == job.generation => {}
                _ => {
                    return Ok(fatal(
                        stage,
                        FailureClass::OrderingViolation,
                        format!("predecessor '{prev}' has no checkpoint in generation {}", job.generation),
                    ));
                }
            }
        }

        if let Some(existing) = self.checkpoints.find_latest(job_id, stage).await? {
            if existing.generation == job.generation {
                tracing::info!(
                    job_id,
                    stage,
                    version = existing.version,
                    "Stage already checkpointed, skipping invocation"
                );
                return Ok(StageResult::Completed(StageCompletion {
                    stage: stage.to_string(),
                    checkpoint: existing,
                    attempts: 0,
                    duration_ms: elapsed_ms(started),
                    replayed: true,
                }));
            }
        }

        let dependencies = self.load_dependencies(job, registered).await?;
        let retry = registered.definition.retry.as_ref().unwrap_or(&self.retry);
        let mut state = RetryState::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request = StageRequest {
                job_key: job.key.clone(),
                stage: stage.to_string(),
                generation: job.generation,
                attempt,
                input_refs: job.input_refs.clone(),
                dependencies: dependencies.clone(),
            };

            tracing::debug!(job_id, stage, attempt, "Invoking stage collaborator");
            let outcome = match tokio::time::timeout(
                registered.definition.timeout,
                registered.collaborator.invoke(request),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => StageOutcome::Retryable {
                    reason: format!("timed out after {:?}", registered.definition.timeout),
                    retry_after: None,
                },
            };

            match outcome {
                StageOutcome::Success {
                    payload,
                    output_refs,
                    metadata,
                } => {
                    let duration_ms = elapsed_ms(started);
                    let write = CheckpointWrite {
                        payload,
                        output_refs,
                        metadata,
                    }
                    .with_metadata("attempts", serde_json::json!(attempt))
                    .with_metadata("duration_ms", serde_json::json!(duration_ms));
                    return self.persist(job, stage, write, attempt, started).await;
                }
                StageOutcome::Retryable { reason, retry_after } => {
                    match should_retry(&mut state, retry, retry_after) {
                        RetryDecision::Retry(delay) => {
                            tracing::warn!(
                                job_id,
                                stage,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                reason = %reason,
                                "Transient stage failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp => {
                            tracing::error!(job_id, stage, attempt, reason = %reason, "Retry budget exhausted");
                            return Ok(fatal(stage, FailureClass::RetriesExhausted, reason));
                        }
                    }
                }
                StageOutcome::Fatal { reason } => {
                    tracing::error!(job_id, stage, attempt, reason = %reason, "Stage failed");
                    return Ok(fatal(stage, FailureClass::Unrecoverable, reason));
                }
            }
        }
    }

    async fn persist(
        &self,
        job: &Job,
        stage: &str,
        write: CheckpointWrite,
        attempts: u32,
        started: Instant,
    ) -> Result<StageResult> {
        let job_id = job.key.job_id.as_str();
        let (checkpoint, replayed) = match self.checkpoints.save(job_id, stage, job.generation, write).await {
            Ok(checkpoint) => (checkpoint, false),
            Err(JobflowError::DuplicateCheckpoint(dup)) => match dup.existing {
                Some(existing) => {
                    tracing::info!(
                        job_id,
                        stage,
                        version = existing.version,
                        "Checkpoint written concurrently, using stored output"
                    );
                    (existing, true)
                }
                None => return Err(JobflowError::DuplicateCheckpoint(dup)),
            },
            Err(err) => return Err(err),
        };

        Ok(StageResult::Completed(StageCompletion {
            stage: stage.to_string(),
            checkpoint,
            attempts,
            duration_ms: elapsed_ms(started),
            replayed,
        }))
    }

    async fn load_dependencies(
        &self,
        job: &Job,
        registered: &RegisteredStage,
    ) -> Result<BTreeMap<String, DependencyInput>> {
        let mut inputs = BTreeMap::new();
        for dep in &registered.definition.dependencies {
            let input = match self.checkpoints.find_latest(&job.key.job_id, dep).await? {
                Some(checkpoint) if checkpoint.generation == job.generation => {
                    let payload = self.checkpoints.load_payload(&checkpoint).await?;
                    DependencyInput::Present { checkpoint, payload }
                }
                _ => DependencyInput::Absent,
            };
            inputs.insert(dep.clone(), input);
        }
        Ok(inputs)
    }
}

fn fatal(stage: &str, class: FailureClass, reason: impl Into<String>) -> StageResult {
    StageResult::Failed(FatalStageError::new(stage, class, reason))
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
