//! The job state machine.
//!
//! The orchestrator walks a job's frozen plan from its resume point, runs
//! each stage through the [`StageExecutor`], and records progress with one
//! conditional write per stage. A lost write means another worker owns the
//! job; the orchestrator then stops without touching anything else and lets
//! the queue redeliver the message.
//!
//! With a [`LeaseConfig`], a run also claims the job record and renews the
//! claim while a stage is in flight. A redelivered message for a job whose
//! lease is live is dropped instead of running the stage a second time; if
//! the holder dies, the lease lapses and the next delivery or the stall
//! sweep picks the job up.

mod recovery;


pub use recovery::{RecoveryCoordinator, ResumePoint};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::core::{Job, JobKey, ProcessingEvent, ProcessingEventType};
use crate::errors::{JobFailure, JobflowError, Result};
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::{StageExecutor, StageResult};
use crate::jobs::JobStore;
use crate::observability::{Metrics, NoOpMetrics};
use crate::queue::{JobMessage, JobQueue};
use crate::utils::{correlation_id, now_utc};

/// How long a run's claim on a job lasts and how often it is renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Lifetime of a claim that is not renewed.
    pub ttl: Duration,
    /// Renewal period while a stage runs; shorter than `ttl`.
    pub heartbeat: Duration,
}

/// How one pickup of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every planned stage completed.
    Completed,
    /// A stage failed fatally; the failure is recorded on the job.
    Failed(JobFailure),
    /// The job was already completed or failed.
    AlreadyTerminal,
    /// No job record exists for the key.
    Missing,
    /// Another worker or a storage fault interrupted the run; nothing was
    /// recorded past the last successful write.
    Abandoned {
        /// Why the run stopped.
        reason: String,
    },
    /// Another run holds a live lease on the job; this delivery is a
    /// duplicate.
    Leased {
        /// Correlation id of the run holding the lease.
        holder: String,
    },
    /// The time budget ran out between stages; progress is saved.
    Yielded {
        /// Stage the next pickup starts with.
        next_stage: String,
    },
}

impl RunOutcome {
    /// Returns true if the queue message is finished with.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed(_)
                | Self::AlreadyTerminal
                | Self::Missing
                | Self::Leased { .. }
        )
    }

    /// Metric label for this outcome.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::AlreadyTerminal => "already_terminal",
            Self::Missing => "missing",
            Self::Abandoned { .. } => "abandoned",
            Self::Leased { .. } => "leased",
            Self::Yielded { .. } => "yielded",
        }
    }
}

/// Drives jobs through their stage plans.
#[derive(Clone)]
pub struct Orchestrator {
    jobs: JobStore,
    executor: StageExecutor,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn Metrics>,
    time_budget: Option<Duration>,
    lease: Option<LeaseConfig>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("jobs", &self.jobs)
            .field("executor", &self.executor)
            .field("time_budget", &self.time_budget)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator without a time budget or event sink.
    #[must_use]
    pub fn new(jobs: JobStore, executor: StageExecutor) -> Self {
        Self {
            jobs,
            executor,
            events: Arc::new(NoOpEventSink),
            metrics: Arc::new(NoOpMetrics),
            time_budget: None,
            lease: None,
        }
    }

    /// Sets the audit event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stops starting new stages once a run has taken `budget`.
    #[must_use]
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// Claims jobs while running them, renewing the claim every
    /// `lease.heartbeat`.
    #[must_use]
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = Some(lease);
        self
    }

    /// The job store in use.
    #[must_use]
    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Runs the job identified by `key` from its resume point.
    ///
    /// Storage faults and lost conditional writes end the run as
    /// [`RunOutcome::Abandoned`]; `Err` is reserved for records that break
    /// the lifecycle rules.
    pub async fn run(&self, key: &JobKey) -> Result<RunOutcome> {
        let run_id = correlation_id(&key.job_id);
        let span = tracing::info_span!("job_run", job_key = %key, correlation_id = %run_id);
        let started = Instant::now();
        let outcome = self.run_inner(key, &run_id).instrument(span).await;
        let label = outcome.as_ref().map_or("error", RunOutcome::label);
        self.metrics.run_finished(label, started.elapsed());
        outcome
    }

    async fn run_inner(&self, key: &JobKey, run_id: &str) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut job = match self.jobs.find(key).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!("Job record not found");
                return Ok(RunOutcome::Missing);
            }
            Err(err) => return abandon(err),
        };

        match RecoveryCoordinator::resume_point(&job) {
            ResumePoint::Finished => {
                tracing::info!(status = %job.status, "Job already finished, nothing to do");
                return Ok(RunOutcome::AlreadyTerminal);
            }
            ResumePoint::Start(stage) => {
                tracing::info!(stage = %stage, pipeline = %job.pipeline, "Starting job");
            }
            ResumePoint::Resume { stage, completed } => {
                tracing::info!(stage = %stage, completed, attempts = job.attempts, "Resuming job");
            }
        }

        if let Some(lease) = self.lease {
            if let Some(held) = job.leased_elsewhere(run_id, &now_utc()) {
                tracing::info!(
                    holder = %held.holder,
                    expires_at = %held.expires_at,
                    "Job leased by a live run, dropping duplicate delivery"
                );
                return Ok(RunOutcome::Leased {
                    holder: held.holder.clone(),
                });
            }
            job.acquire_lease(run_id, lease.ttl);
        }
        job.begin_processing()?;
        if let Err(err) = self.jobs.update(&mut job).await {
            return abandon(err);
        }

        while let Some(stage) = job.next_stage().map(str::to_string) {
            if let Some(budget) = self.time_budget {
                if started.elapsed() >= budget {
                    tracing::info!(next_stage = %stage, "Time budget spent, yielding");
                    if job.lease.is_some() {
                        job.release_lease();
                        if let Err(err) = self.jobs.update(&mut job).await {
                            return abandon(err);
                        }
                    }
                    return Ok(RunOutcome::Yielded { next_stage: stage });
                }
            }

            self.events
                .emit(ProcessingEvent::stage_started(&key.job_id, &stage))
                .await;
            let stage_started = Instant::now();
            let result = match self.execute_leased(&mut job, &stage, run_id).await {
                Ok(result) => result,
                Err(err) => {
                    self.metrics
                        .stage_finished(&stage, "abandoned", stage_started.elapsed());
                    return abandon(err);
                }
            };
            let stage_outcome = match &result {
                StageResult::Completed(_) => "completed",
                StageResult::Failed(_) => "failed",
            };
            self.metrics
                .stage_finished(&stage, stage_outcome, stage_started.elapsed());

            match result {
                StageResult::Completed(done) => {
                    if let Some(lease) = self.lease {
                        job.acquire_lease(run_id, lease.ttl);
                    }
                    job.complete_stage(&stage, done.output_refs().clone())?;
                    if let Err(err) = self.jobs.update(&mut job).await {
                        return abandon(err);
                    }
                    tracing::info!(
                        stage = %stage,
                        version = done.checkpoint.version,
                        attempts = done.attempts,
                        replayed = done.replayed,
                        "Stage completed"
                    );
                    self.events
                        .emit(
                            ProcessingEvent::stage_completed(&key.job_id, &stage, done.duration_ms)
                                .with_detail("attempts", serde_json::json!(done.attempts)),
                        )
                        .await;
                }
                StageResult::Failed(err) => {
                    let failure = JobFailure::from_stage_error(&err);
                    job.fail(failure.clone())?;
                    if let Err(write_err) = self.jobs.update(&mut job).await {
                        return abandon(write_err);
                    }
                    tracing::error!(stage = %stage, class = %err.class, reason = %err.reason, "Job failed");
                    self.events
                        .emit(ProcessingEvent::stage_failed(&key.job_id, &stage, &err.reason))
                        .await;
                    self.events
                        .emit(ProcessingEvent::job_failed(&key.job_id, &err.to_string()))
                        .await;
                    return Ok(RunOutcome::Failed(failure));
                }
            }
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(duration_ms, outputs = job.output_refs.len(), "Job completed");
        self.events
            .emit(ProcessingEvent::job_completed(&key.job_id, duration_ms))
            .await;
        Ok(RunOutcome::Completed)
    }

    /// Runs one stage, renewing the lease on `job` until the stage settles.
    ///
    /// A renewal that loses its conditional write ends the stage early: some
    /// other run has taken the job over.
    async fn execute_leased(&self, job: &mut Job, stage: &str, run_id: &str) -> Result<StageResult> {
        let Some(lease) = self.lease else {
            return self.executor.execute(job, stage).await;
        };

        let snapshot = job.clone();
        let execution = self.executor.execute(&snapshot, stage);
        tokio::pin!(execution);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + lease.heartbeat, lease.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = heartbeat.tick() => {
                    job.acquire_lease(run_id, lease.ttl);
                    self.jobs.update(job).await?;
                    tracing::debug!(stage, "Lease renewed");
                }
            }
        }
    }

    /// Starts a terminal job over under a new generation and re-enqueues it.
    ///
    /// The frozen plan is kept. Checkpoints of earlier generations stay in
    /// place; the new generation writes new versions.
    pub async fn rerun(&self, key: &JobKey, queue: &dyn JobQueue) -> Result<Job> {
        let mut job = self.jobs.get(key).await?;
        job.reset_for_rerun()?;
        self.jobs.update(&mut job).await?;
        queue.enqueue(JobMessage::for_job(&job.key)).await?;

        tracing::info!(job_key = %key, generation = job.generation, "Job re-run requested");
        self.events
            .emit(
                ProcessingEvent::new(&key.job_id, ProcessingEventType::JobCreated)
                    .with_detail("pipeline", serde_json::json!(job.pipeline))
                    .with_detail("generation", serde_json::json!(job.generation)),
            )
            .await;
        Ok(job)
    }
}

fn abandon(err: JobflowError) -> Result<RunOutcome> {
    match err {
        JobflowError::Conflict(_) => {
            tracing::info!(error = %err, "Lost conditional write, another worker owns the job");
        }
        JobflowError::Storage(_)
        | JobflowError::Io(_)
        | JobflowError::Serialization(_)
        | JobflowError::NotFound(_)
        | JobflowError::DuplicateCheckpoint(_) => {
            tracing::warn!(error = %err, "Storage fault, abandoning run");
        }
        other => return Err(other),
    }
    Ok(RunOutcome::Abandoned {
        reason: err.to_string(),
    })
}
