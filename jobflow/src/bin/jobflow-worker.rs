//! Worker process.
//!
//! Loads configuration from the environment (and `.env`), re-enqueues jobs
//! left `queued` or stalled in storage, then consumes the queue until
//! interrupted. Stages are delegated to the service named by
//! `stage_service.url` (`JOBFLOW_STAGE_SERVICE_URL`). Run metrics are
//! written to `metrics.textfile` (`JOBFLOW_METRICS_FILE`) when it is set.

use anyhow::Context;
use std::sync::Arc;

use jobflow::checkpoint::CheckpointStore;
use jobflow::config::JobflowConfig;
use jobflow::core::JobStatus;
use jobflow::events::{EventSink, FanoutEventSink, LoggingEventSink, StorageEventSink};
use jobflow::executor::{HttpCollaborator, StageCollaborator, StageDefinition, StageExecutor, StageRegistry};
use jobflow::jobs::JobStore;
use jobflow::observability::{init_tracing, Metrics, PrometheusMetrics};
use jobflow::orchestrator::{Orchestrator, RecoveryCoordinator};
use jobflow::queue::{DeadLetterProcessor, InMemoryJobQueue, JobMessage, JobQueue};
use jobflow::storage::{self, RetentionSweeper};
use jobflow::worker::{Worker, WorkerPool};

fn build_registry(config: &JobflowConfig, collaborator: &Arc<dyn StageCollaborator>) -> anyhow::Result<StageRegistry> {
    let mut registry = StageRegistry::new();
    for definition in StageDefinition::builtin() {
        registry.register(definition, collaborator.clone());
    }
    for stage in config.pipelines.pipelines.values().flatten() {
        if !registry.contains(stage) {
            registry.register(StageDefinition::new(stage.clone()), collaborator.clone());
        }
    }
    registry.validate().context("invalid stage graph")?;
    for (name, plan) in &config.pipelines.pipelines {
        registry
            .check_plan(plan)
            .with_context(|| format!("pipeline '{name}' cannot run"))?;
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = JobflowConfig::from_env().context("loading configuration")?;
    init_tracing(&config.logging)?;

    let storage = storage::connect(&config.storage)
        .await
        .context("connecting storage")?;
    let service_url = config
        .stage_service
        .url
        .clone()
        .context("stage service URL is not configured (JOBFLOW_STAGE_SERVICE_URL)")?;
    let collaborator: Arc<dyn StageCollaborator> =
        Arc::new(HttpCollaborator::new(&service_url, config.stage_service.timeout())?);
    let registry = build_registry(&config, &collaborator)?;
    tracing::info!(stages = ?registry.names(), service = %service_url, "Stages registered");

    let dead_letter = Arc::new(InMemoryJobQueue::new("jobs-dlq", config.worker.queue_config()));
    let queue = Arc::new(
        InMemoryJobQueue::new("jobs", config.worker.queue_config()).with_dead_letter(dead_letter.clone()),
    );
    let events: Arc<dyn EventSink> = Arc::new(FanoutEventSink::new(vec![
        Arc::new(LoggingEventSink::default()) as Arc<dyn EventSink>,
        Arc::new(StorageEventSink::new(storage.clone()).with_retention_days(config.retention.events_days)),
    ]));

    let metrics = Arc::new(PrometheusMetrics::new()?);
    if let Some(path) = config.metrics.textfile.clone() {
        let exporter = metrics.clone();
        let mut ticker = tokio::time::interval(config.metrics.interval());
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                if let Err(err) = exporter.write_textfile(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "Metrics export failed");
                }
            }
        });
    }

    let jobs = JobStore::new(storage.clone());
    let checkpoints = CheckpointStore::new(storage.clone()).with_retention_days(config.retention.checkpoints_days);
    let executor = StageExecutor::new(Arc::new(registry), checkpoints).with_retry(config.retry.clone());
    let mut orchestrator = Orchestrator::new(jobs.clone(), executor)
        .with_events(events.clone())
        .with_metrics(metrics.clone() as Arc<dyn Metrics>)
        .with_lease(config.worker.lease());
    if let Some(budget) = config.worker.job_time_budget() {
        orchestrator = orchestrator.with_time_budget(budget);
    }

    let pending = jobs.list_by_status(JobStatus::Queued, None).await?;
    for job in &pending {
        queue.enqueue(JobMessage::for_job(&job.key)).await?;
    }
    tracing::info!(queued = pending.len(), "Queue rehydrated from storage");

    let pool = WorkerPool::new(config.worker.clone(), Worker::new(orchestrator, queue.clone()))
        .with_recovery(RecoveryCoordinator::new(jobs.clone()))
        .with_dead_letter(DeadLetterProcessor::new(dead_letter, jobs, events).with_metrics(metrics))
        .with_retention(RetentionSweeper::new(storage.clone()));
    let report = pool.maintain().await?;
    tracing::info!(
        requeued = report.requeued,
        dead_lettered = report.dead_lettered,
        expired = report.expired,
        "Startup maintenance done"
    );

    pool.start();
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    pool.shutdown("interrupt").await;
    Ok(())
}
