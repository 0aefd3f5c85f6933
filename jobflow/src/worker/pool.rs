//! Queue consumers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

use super::ShutdownToken;
use crate::config::WorkerConfig;
use crate::errors::Result;
use crate::orchestrator::{Orchestrator, RecoveryCoordinator, RunOutcome};
use crate::queue::{DeadLetterProcessor, JobQueue, ReceivedMessage};
use crate::storage::RetentionSweeper;
use crate::utils::now_utc;

/// What a worker did with a message after running its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The job is settled, or a live run holds its lease; the message was
    /// deleted.
    Acked,
    /// The job yielded; the message is visible again right away.
    Released,
    /// The run was interrupted; the message reappears after the
    /// visibility timeout.
    LeftInFlight,
}

/// Runs the job behind one message at a time.
pub struct Worker {
    orchestrator: Orchestrator,
    queue: Arc<dyn JobQueue>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker consuming `queue`.
    #[must_use]
    pub fn new(orchestrator: Orchestrator, queue: Arc<dyn JobQueue>) -> Self {
        Self { orchestrator, queue }
    }

    /// The queue this worker consumes.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// The orchestrator jobs are run with.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs the job named by `received` and settles the message.
    pub async fn handle(&self, received: &ReceivedMessage) -> Disposition {
        let key = match received.message.job_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(
                    job_id = %received.message.job_id,
                    tenant_key = %received.message.tenant_key,
                    error = %err,
                    "Malformed queue message, dropping"
                );
                return self.ack(received).await;
            }
        };

        tracing::debug!(job_key = %key, receive_count = received.receive_count, "Message received");
        match self.orchestrator.run(&key).await {
            Ok(outcome) if outcome.is_settled() => self.ack(received).await,
            Ok(RunOutcome::Yielded { next_stage }) => {
                tracing::info!(job_key = %key, next_stage = %next_stage, "Job yielded, releasing message");
                self.release(received).await
            }
            Ok(outcome) => {
                tracing::info!(job_key = %key, ?outcome, "Run interrupted, awaiting redelivery");
                Disposition::LeftInFlight
            }
            Err(err) => {
                tracing::error!(job_key = %key, error = %err, kind = err.kind(), "Run failed, awaiting redelivery");
                Disposition::LeftInFlight
            }
        }
    }

    /// Receives and handles one message, if one is visible.
    pub async fn poll_once(&self) -> Result<Option<Disposition>> {
        let Some(received) = self.queue.receive().await? else {
            return Ok(None);
        };
        Ok(Some(self.handle(&received).await))
    }

    /// Handles messages until none is visible; returns how many were handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while self.poll_once().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    async fn ack(&self, received: &ReceivedMessage) -> Disposition {
        match self.queue.ack(&received.receipt).await {
            Ok(()) => Disposition::Acked,
            Err(err) => {
                tracing::warn!(job_id = %received.message.job_id, error = %err, "Ack failed");
                Disposition::LeftInFlight
            }
        }
    }

    async fn release(&self, received: &ReceivedMessage) -> Disposition {
        match self.queue.release(&received.receipt).await {
            Ok(()) => Disposition::Released,
            Err(err) => {
                tracing::warn!(job_id = %received.message.job_id, error = %err, "Release failed");
                Disposition::LeftInFlight
            }
        }
    }
}

/// Work done by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Stalled jobs put back on the queue.
    pub requeued: usize,
    /// Dead-lettered messages turned into job failures.
    pub dead_lettered: usize,
    /// Expired records removed by the retention sweep.
    pub expired: usize,
}

/// N workers polling one queue, plus an optional maintenance loop.
pub struct WorkerPool {
    worker: Arc<Worker>,
    config: WorkerConfig,
    recovery: Option<RecoveryCoordinator>,
    dead_letter: Option<Arc<DeadLetterProcessor>>,
    retention: Option<RetentionSweeper>,
    shutdown: ShutdownToken,
    handled: Arc<AtomicUsize>,
    tasks: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.config.workers)
            .field("handled", &self.handled())
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool; nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(config: WorkerConfig, worker: Worker) -> Self {
        Self {
            worker: Arc::new(worker),
            config,
            recovery: None,
            dead_letter: None,
            retention: None,
            shutdown: ShutdownToken::new(),
            handled: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Re-enqueues stalled jobs during maintenance.
    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryCoordinator) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Drains the dead-letter queue during maintenance.
    #[must_use]
    pub fn with_dead_letter(mut self, processor: DeadLetterProcessor) -> Self {
        self.dead_letter = Some(Arc::new(processor));
        self
    }

    /// Deletes expired records during maintenance.
    #[must_use]
    pub fn with_retention(mut self, sweeper: RetentionSweeper) -> Self {
        self.retention = Some(sweeper);
        self
    }

    /// Token that stops the pool.
    #[must_use]
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Messages handled since the pool started.
    #[must_use]
    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::Relaxed)
    }

    /// Spawns the workers and, if configured, the maintenance loop.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tracing::info!(workers = self.config.workers, "Starting worker pool");
        for id in 0..self.config.workers {
            let worker = self.worker.clone();
            let shutdown = self.shutdown.clone();
            let handled = self.handled.clone();
            let poll_interval = self.config.poll_interval();
            tasks.spawn(async move {
                tracing::debug!(worker = id, "Worker started");
                while !shutdown.is_stopped() {
                    match worker.poll_once().await {
                        Ok(Some(disposition)) => {
                            handled.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(worker = id, ?disposition, "Message handled");
                            continue;
                        }
                        Ok(None) => {}
                        Err(err) => tracing::warn!(worker = id, error = %err, "Receive failed"),
                    }
                    tokio::select! {
                        () = shutdown.stopped() => break,
                        () = tokio::time::sleep(poll_interval) => {}
                    }
                }
                tracing::debug!(worker = id, "Worker stopped");
            });
        }

        if self.recovery.is_some() || self.dead_letter.is_some() || self.retention.is_some() {
            let maintenance = self.maintenance_handle();
            let shutdown = self.shutdown.clone();
            let interval = self.config.maintenance_interval();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.stopped() => break,
                        () = tokio::time::sleep(interval) => {}
                    }
                    if let Err(err) = maintenance.run().await {
                        tracing::warn!(error = %err, "Maintenance pass failed");
                    }
                }
            });
        }
    }

    /// Runs one maintenance pass now.
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        self.maintenance_handle().run().await
    }

    /// Stops polling and waits for in-flight messages to finish.
    pub async fn shutdown(&self, reason: &str) {
        self.shutdown.stop(reason);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "Worker task ended abnormally");
            }
        }
        tracing::info!(handled = self.handled(), "Worker pool stopped");
    }

    fn maintenance_handle(&self) -> Maintenance {
        Maintenance {
            queue: self.worker.queue.clone(),
            recovery: self.recovery.clone(),
            dead_letter: self.dead_letter.clone(),
            retention: self.retention.clone(),
            stall_threshold: self.config.stall_threshold(),
        }
    }
}

struct Maintenance {
    queue: Arc<dyn JobQueue>,
    recovery: Option<RecoveryCoordinator>,
    dead_letter: Option<Arc<DeadLetterProcessor>>,
    retention: Option<RetentionSweeper>,
    stall_threshold: std::time::Duration,
}

impl Maintenance {
    async fn run(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        if let Some(processor) = &self.dead_letter {
            report.dead_lettered = processor.drain().await?;
        }
        if let Some(recovery) = &self.recovery {
            report.requeued = recovery
                .requeue_stalled(self.stall_threshold, self.queue.as_ref())
                .await?;
        }
        if let Some(sweeper) = &self.retention {
            report.expired = sweeper.sweep(&now_utc()).await?;
        }
        if report != MaintenanceReport::default() {
            tracing::info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                expired = report.expired,
                "Maintenance pass"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobStatus;
    use crate::events::NoOpEventSink;
    use crate::queue::{InMemoryJobQueue, JobMessage, QueueConfig};
    use crate::storage::Storage;
    use crate::testing::{FaultyStorage, ScriptedCollaborator, TestHarness};
    use std::time::Duration;

    const PLAN: &[&str] = &["extract", "generate"];

    fn worker(harness: &TestHarness) -> Worker {
        Worker::new(harness.orchestrator(), harness.queue.clone())
    }

    fn fast_config(workers: usize) -> WorkerConfig {
        WorkerConfig {
            workers,
            poll_interval_ms: 5,
            stall_threshold_secs: 0,
            maintenance_interval_secs: 3_600,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_settled_job_is_acked() {
        let harness = TestHarness::new(PLAN);
        let job = harness.submit(PLAN).await;

        assert_eq!(worker(&harness).poll_once().await.unwrap(), Some(Disposition::Acked));
        assert!(harness.queue.is_empty());
        assert_eq!(harness.jobs().get(&job.key).await.unwrap().status, JobStatus::Completed);
        assert_eq!(worker(&harness).poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_job_is_acked() {
        let mut harness = TestHarness::new(PLAN);
        harness.set_collaborator(
            "extract",
            ScriptedCollaborator::scripted([crate::executor::StageOutcome::fatal("bad scan")]),
        );
        harness.submit(PLAN).await;
        assert_eq!(worker(&harness).poll_once().await.unwrap(), Some(Disposition::Acked));
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_run_stays_in_flight() {
        let harness = TestHarness::new(PLAN);
        harness.submit(PLAN).await;
        let storage: Arc<dyn Storage> = Arc::new(FaultyStorage::new(harness.storage.clone()).failing_from(0));
        let worker = Worker::new(harness.orchestrator_on(storage), harness.queue.clone());

        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::LeftInFlight));
        assert_eq!(harness.queue.len(), 1);
        assert_eq!(harness.queue.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_of_leased_job_is_acked() {
        let harness = TestHarness::new(PLAN);
        let mut job = harness.submit(PLAN).await;
        job.acquire_lease("other-run", Duration::from_secs(60));
        job.begin_processing().unwrap();
        harness.jobs().update(&mut job).await.unwrap();

        let lease = crate::orchestrator::LeaseConfig {
            ttl: Duration::from_secs(1),
            heartbeat: Duration::from_millis(100),
        };
        let worker = Worker::new(harness.orchestrator().with_lease(lease), harness.queue.clone());
        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Acked));
        assert!(harness.queue.is_empty());
        assert_eq!(harness.collaborator("extract").call_count(), 0);
        assert_eq!(harness.jobs().get(&job.key).await.unwrap().status, JobStatus::Processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_yielded_run_is_released() {
        let mut harness = TestHarness::new(PLAN);
        harness.set_collaborator(
            "extract",
            ScriptedCollaborator::new().with_delay(Duration::from_millis(50)),
        );
        let job = harness.submit(PLAN).await;
        let orchestrator = harness.orchestrator().with_time_budget(Duration::from_millis(10));
        let worker = Worker::new(orchestrator, harness.queue.clone());

        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Released));
        assert_eq!(harness.queue.in_flight(), 0);

        // The released message is picked up again and finishes the plan.
        assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Acked));
        assert_eq!(harness.jobs().get(&job.key).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let harness = TestHarness::new(PLAN);
        harness
            .queue
            .enqueue(JobMessage {
                job_id: "not-a-job".to_string(),
                tenant_key: "acme".to_string(),
                attempt_count: 0,
            })
            .await
            .unwrap();
        assert_eq!(worker(&harness).poll_once().await.unwrap(), Some(Disposition::Acked));
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_runs_every_job() {
        let harness = TestHarness::new(PLAN);
        let a = harness.submit(PLAN).await;
        let b = harness.submit(PLAN).await;
        assert_eq!(worker(&harness).drain().await.unwrap(), 2);
        for job in [a, b] {
            assert_eq!(harness.jobs().get(&job.key).await.unwrap().status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_pool_processes_queue_and_shuts_down() {
        let harness = TestHarness::new(PLAN);
        let mut jobs = Vec::new();
        for _ in 0..5 {
            jobs.push(harness.submit(PLAN).await);
        }

        let pool = WorkerPool::new(fast_config(3), worker(&harness));
        pool.start();
        for _ in 0..200 {
            if harness.queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown("test finished").await;

        assert!(harness.queue.is_empty());
        assert_eq!(pool.handled(), 5);
        assert_eq!(pool.shutdown_token().reason().as_deref(), Some("test finished"));
        for job in &jobs {
            assert_eq!(harness.jobs().get(&job.key).await.unwrap().status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_maintenance_requeues_and_dead_letters() {
        let harness = TestHarness::new(PLAN);

        // A job whose worker died mid-run.
        let mut stalled = harness.submit(PLAN).await;
        let intake = harness.queue.receive().await.unwrap().unwrap();
        harness.queue.ack(&intake.receipt).await.unwrap();
        stalled.begin_processing().unwrap();
        harness.jobs().update(&mut stalled).await.unwrap();

        // A job whose message ran out of receives.
        let dead = harness.submit(PLAN).await;
        let dlq = Arc::new(InMemoryJobQueue::new("jobs-dlq", QueueConfig::default()));
        dlq.enqueue(JobMessage {
            attempt_count: 3,
            ..JobMessage::for_job(&dead.key)
        })
        .await
        .unwrap();

        let pool = WorkerPool::new(fast_config(1), worker(&harness))
            .with_recovery(RecoveryCoordinator::new(harness.jobs()))
            .with_dead_letter(DeadLetterProcessor::new(
                dlq.clone(),
                harness.jobs(),
                Arc::new(NoOpEventSink),
            ));

        std::thread::sleep(Duration::from_millis(5));
        let report = pool.maintain().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.requeued, 1);
        assert!(dlq.is_empty());

        let failed = harness.jobs().get(&dead.key).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error.unwrap().class,
            crate::errors::FailureClass::DeadLettered
        );

        // The stalled job's new message plus the dead job's original one.
        assert_eq!(harness.queue.len(), 2);
        assert_eq!(worker(&harness).drain().await.unwrap(), 2);
        assert_eq!(
            harness.jobs().get(&stalled.key).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_expired_records() {
        let harness = TestHarness::new(PLAN);
        let job = harness.submit(PLAN).await;
        harness
            .storage
            .put_record(
                crate::storage::schema::EVENTS_TABLE,
                "job_old#2020-01-01#e1",
                serde_json::json!({"expires_at": "2020-01-01T00:00:00.000000+00:00"}),
                crate::storage::WriteCondition::Always,
            )
            .await
            .unwrap();

        let pool = WorkerPool::new(fast_config(1), worker(&harness))
            .with_retention(RetentionSweeper::new(harness.storage.clone()));
        let report = pool.maintain().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.requeued, 0);
        assert!(harness.jobs().get(&job.key).await.is_ok());
    }
}
