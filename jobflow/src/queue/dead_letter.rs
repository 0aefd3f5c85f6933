//! Handling of messages the job queue gave up on.
//!
//! A dead-lettered message means some worker kept dying or abandoning the
//! job. The processor records that on the job as a `dead_lettered` failure
//! so callers polling status see a diagnosable error instead of a job that
//! stays `processing` forever.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{JobQueue, ReceivedMessage};
use crate::core::{Job, ProcessingEvent};
use crate::errors::{FailureClass, JobFailure, Result};
use crate::events::EventSink;
use crate::jobs::JobStore;
use crate::observability::{Metrics, NoOpMetrics};

/// Receive count from which repeated failures count as persistent.
const PERSISTENT_FAILURE_RECEIVES: u32 = 3;

/// Coarse classification of a dead-lettered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// Failed on the first delivery; likely the worker environment, not the job.
    InfrastructureFailure,
    /// Failed repeatedly; the job itself is likely the problem.
    ProcessingFailure,
    /// Failed a few times without a clear pattern.
    TemporaryFailure,
}

impl DeadLetterKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InfrastructureFailure => "infrastructure_failure",
            Self::ProcessingFailure => "processing_failure",
            Self::TemporaryFailure => "temporary_failure",
        }
    }
}

/// What the processor concluded about one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterAnalysis {
    /// Classification.
    pub kind: DeadLetterKind,
    /// Deliveries on the source queue.
    pub receive_count: u32,
    /// Seconds between enqueue and first delivery.
    pub queue_wait_seconds: i64,
    /// Human-readable summary, stored as the failure reason.
    ///
    /// Carries no delivery counts; those stay in logs and audit events.
    pub summary: String,
    /// Whether the failure warrants an alert.
    pub critical: bool,
}

impl DeadLetterAnalysis {
    /// Classifies a message received from the dead-letter queue.
    ///
    /// The source queue's receive count travels in `attempt_count`.
    #[must_use]
    pub fn of(received: &ReceivedMessage) -> Self {
        let receive_count = received.message.attempt_count;
        let queue_wait_seconds = (received.first_received_at - received.sent_at)
            .num_seconds()
            .max(0);
        let kind = match receive_count {
            n if n >= PERSISTENT_FAILURE_RECEIVES => DeadLetterKind::ProcessingFailure,
            0 | 1 => DeadLetterKind::InfrastructureFailure,
            _ => DeadLetterKind::TemporaryFailure,
        };
        let summary = match kind {
            DeadLetterKind::InfrastructureFailure => {
                format!("Worker failed on first delivery after {queue_wait_seconds}s in queue")
            }
            DeadLetterKind::ProcessingFailure => "Persistent processing failure".to_string(),
            DeadLetterKind::TemporaryFailure => "Temporary processing failure".to_string(),
        };
        let critical = kind == DeadLetterKind::InfrastructureFailure
            || receive_count >= PERSISTENT_FAILURE_RECEIVES;

        Self {
            kind,
            receive_count,
            queue_wait_seconds,
            summary,
            critical,
        }
    }
}

/// What happened to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterAction {
    /// The job was marked failed.
    Failed(DeadLetterAnalysis),
    /// The job had already finished; nothing to record.
    AlreadyTerminal,
    /// The message names no job that can be loaded.
    Discarded,
    /// The job changed underneath; the message should be retried.
    Contended,
}

/// Drains a dead-letter queue into job failures.
pub struct DeadLetterProcessor {
    queue: Arc<dyn JobQueue>,
    jobs: JobStore,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn Metrics>,
}

impl std::fmt::Debug for DeadLetterProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterProcessor")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl DeadLetterProcessor {
    /// Creates a processor reading from the dead-letter `queue`.
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, jobs: JobStore, events: Arc<dyn EventSink>) -> Self {
        Self {
            queue,
            jobs,
            events,
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Counts recorded failures by [`DeadLetterKind`].
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Records the failure described by one dead-lettered message.
    pub async fn process(&self, received: &ReceivedMessage) -> Result<DeadLetterAction> {
        let key = match received.message.job_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(job_id = %received.message.job_id, error = %err, "Dead-lettered message has a malformed key");
                return Ok(DeadLetterAction::Discarded);
            }
        };
        let Some(mut job) = self.jobs.find(&key).await? else {
            tracing::warn!(job_key = %key, "Dead-lettered job not found");
            return Ok(DeadLetterAction::Discarded);
        };
        if job.is_terminal() {
            tracing::info!(job_key = %key, status = %job.status, "Dead-lettered job already finished");
            return Ok(DeadLetterAction::AlreadyTerminal);
        }

        let analysis = DeadLetterAnalysis::of(received);
        mark_dead_lettered(&mut job, &analysis)?;
        if let Err(err) = self.jobs.update(&mut job).await {
            if err.is_conflict() {
                return Ok(DeadLetterAction::Contended);
            }
            return Err(err);
        }

        self.metrics.dead_lettered(analysis.kind.as_str());
        if analysis.critical {
            tracing::error!(
                job_key = %key,
                failure_type = analysis.kind.as_str(),
                receive_count = analysis.receive_count,
                summary = %analysis.summary,
                "Critical job failure"
            );
        } else {
            tracing::warn!(
                job_key = %key,
                failure_type = analysis.kind.as_str(),
                receive_count = analysis.receive_count,
                summary = %analysis.summary,
                "Job dead-lettered"
            );
        }
        self.events
            .emit(
                ProcessingEvent::job_failed(&key.job_id, &analysis.summary)
                    .with_detail("failure_type", serde_json::json!(analysis.kind.as_str()))
                    .with_detail("receive_count", serde_json::json!(analysis.receive_count)),
            )
            .await;
        Ok(DeadLetterAction::Failed(analysis))
    }

    /// Processes every visible message; returns how many were handled.
    ///
    /// Contended messages and messages that hit a storage error are released
    /// for a later pass.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        let mut deferred = Vec::new();
        while let Some(received) = self.queue.receive().await? {
            match self.process(&received).await {
                Ok(DeadLetterAction::Contended) => deferred.push(received.receipt),
                Ok(_) => {
                    self.queue.ack(&received.receipt).await?;
                    handled += 1;
                }
                Err(err) => {
                    tracing::warn!(job_id = %received.message.job_id, error = %err, "Dead-letter processing failed");
                    deferred.push(received.receipt);
                }
            }
        }
        for receipt in deferred {
            self.queue.release(&receipt).await?;
        }
        Ok(handled)
    }
}

fn mark_dead_lettered(job: &mut Job, analysis: &DeadLetterAnalysis) -> Result<()> {
    let failed_stage = job.current_stage.clone();
    if job.status == crate::core::JobStatus::Queued {
        job.begin_processing()?;
    }

    let mut failure = JobFailure {
        stage: failed_stage,
        class: FailureClass::DeadLettered,
        reason: analysis.summary.clone(),
        timestamp: crate::utils::iso_timestamp(),
        details: Default::default(),
    }
    .with_detail("failure_type", serde_json::json!(analysis.kind.as_str()))
    .with_detail("stages_completed", serde_json::json!(job.stages_completed));
    if analysis.critical {
        failure = failure.with_detail("critical", serde_json::json!(true));
    }
    job.fail(failure)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlobRef, JobInput, JobKey, JobStatus};
    use crate::events::CollectingEventSink;
    use crate::queue::{InMemoryJobQueue, JobMessage, QueueConfig};
    use crate::storage::InMemoryStorage;
    use std::collections::BTreeMap;

    fn received(attempts: u32) -> ReceivedMessage {
        let now = crate::utils::now_utc();
        ReceivedMessage {
            receipt: "r-1".to_string(),
            message: JobMessage {
                job_id: "job_20250101120000123".to_string(),
                tenant_key: "acme#c1".to_string(),
                attempt_count: attempts,
            },
            receive_count: 1,
            sent_at: now - chrono::Duration::seconds(5),
            first_received_at: now,
        }
    }

    struct Fixture {
        dlq: Arc<InMemoryJobQueue>,
        jobs: JobStore,
        events: Arc<CollectingEventSink>,
        processor: DeadLetterProcessor,
    }

    fn fixture() -> Fixture {
        let dlq = Arc::new(InMemoryJobQueue::new("jobs-dlq", QueueConfig::default()));
        let jobs = JobStore::new(Arc::new(InMemoryStorage::new()));
        let events = Arc::new(CollectingEventSink::new());
        let processor = DeadLetterProcessor::new(dlq.clone(), jobs.clone(), events.clone());
        Fixture {
            dlq,
            jobs,
            events,
            processor,
        }
    }

    async fn create_job(jobs: &JobStore) -> Job {
        let job = Job::new(
            JobKey::generate("acme", "c1").unwrap(),
            JobInput::new(BlobRef::new("in/doc.pdf")),
            "custom",
            vec!["extract".to_string(), "generate".to_string()],
            30,
        )
        .unwrap();
        jobs.create(&job).await.unwrap();
        job
    }

    #[test]
    fn test_classification() {
        let first = DeadLetterAnalysis::of(&received(1));
        assert_eq!(first.kind, DeadLetterKind::InfrastructureFailure);
        assert!(first.critical);
        assert_eq!(first.queue_wait_seconds, 5);

        let second = DeadLetterAnalysis::of(&received(2));
        assert_eq!(second.kind, DeadLetterKind::TemporaryFailure);
        assert!(!second.critical);

        let third = DeadLetterAnalysis::of(&received(3));
        assert_eq!(third.kind, DeadLetterKind::ProcessingFailure);
        assert!(third.critical);
        assert_eq!(third.summary, "Persistent processing failure");
    }

    #[tokio::test]
    async fn test_processing_job_marked_failed() {
        let fx = fixture();
        let mut job = create_job(&fx.jobs).await;
        job.begin_processing().unwrap();
        job.complete_stage("extract", BTreeMap::new()).unwrap();
        fx.jobs.update(&mut job).await.unwrap();

        let mut message = JobMessage::for_job(&job.key);
        message.attempt_count = 3;
        fx.dlq.enqueue(message).await.unwrap();
        assert_eq!(fx.processor.drain().await.unwrap(), 1);
        assert!(fx.dlq.is_empty());

        let stored = fx.jobs.get(&job.key).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let error = stored.error.unwrap();
        assert_eq!(error.class, FailureClass::DeadLettered);
        assert_eq!(error.stage.as_deref(), Some("generate"));
        assert_eq!(error.details["failure_type"], serde_json::json!("processing_failure"));
        assert_eq!(error.details["stages_completed"], serde_json::json!(["extract"]));
        assert_eq!(stored.stages_completed, vec!["extract".to_string()]);
        assert!(!error.details.contains_key("receive_count"));
        assert!(!error.reason.contains('3'), "{}", error.reason);
        assert_eq!(fx.events.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letters_counted_by_kind() {
        let fx = fixture();
        let metrics = Arc::new(crate::observability::PrometheusMetrics::new().unwrap());
        let processor = DeadLetterProcessor::new(fx.dlq.clone(), fx.jobs.clone(), fx.events.clone())
            .with_metrics(metrics.clone());
        let job = create_job(&fx.jobs).await;
        let mut message = JobMessage::for_job(&job.key);
        message.attempt_count = 3;
        fx.dlq.enqueue(message).await.unwrap();

        assert_eq!(processor.drain().await.unwrap(), 1);
        let text = metrics.encode().unwrap();
        assert!(
            text.contains(r#"jobflow_dead_letters_total{kind="processing_failure"} 1"#),
            "{text}"
        );
    }

    #[tokio::test]
    async fn test_queued_job_marked_failed_without_stage() {
        let fx = fixture();
        let job = create_job(&fx.jobs).await;
        fx.dlq.enqueue(JobMessage::for_job(&job.key)).await.unwrap();
        let received = fx.dlq.receive().await.unwrap().unwrap();

        let action = fx.processor.process(&received).await.unwrap();
        assert!(matches!(action, DeadLetterAction::Failed(_)));
        let stored = fx.jobs.get(&job.key).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.unwrap().stage, None);
    }

    #[tokio::test]
    async fn test_terminal_and_missing_jobs_are_not_touched() {
        let fx = fixture();
        let mut job = create_job(&fx.jobs).await;
        job.begin_processing().unwrap();
        job.complete_stage("extract", BTreeMap::new()).unwrap();
        job.complete_stage("generate", BTreeMap::new()).unwrap();
        fx.jobs.update(&mut job).await.unwrap();

        fx.dlq.enqueue(JobMessage::for_job(&job.key)).await.unwrap();
        let done = fx.dlq.receive().await.unwrap().unwrap();
        assert_eq!(fx.processor.process(&done).await.unwrap(), DeadLetterAction::AlreadyTerminal);
        assert_eq!(fx.jobs.get(&job.key).await.unwrap().status, JobStatus::Completed);

        let missing = received(3);
        assert_eq!(fx.processor.process(&missing).await.unwrap(), DeadLetterAction::Discarded);
        assert!(fx.events.is_empty());
    }
}
