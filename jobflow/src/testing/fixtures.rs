//! A ready-wired engine over in-memory backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ScriptedCollaborator;
use crate::checkpoint::CheckpointStore;
use crate::core::{BlobRef, Job, JobInput, JobKey};
use crate::events::CollectingEventSink;
use crate::executor::{StageDefinition, StageExecutor, StageRegistry};
use crate::jobs::JobStore;
use crate::orchestrator::Orchestrator;
use crate::pipeline::{JitterStrategy, RetryConfig};
use crate::queue::{InMemoryJobQueue, JobMessage, JobQueue, QueueConfig};
use crate::storage::{InMemoryStorage, Storage};

/// Retry budget with millisecond delays, for tests.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .with_base_delay_ms(1)
        .with_max_delay_ms(4)
        .with_jitter(JitterStrategy::None)
}

/// Engine pieces sharing one storage backend.
///
/// Each stage gets its own [`ScriptedCollaborator`]; script it through
/// [`collaborator`](Self::collaborator) before running a job.
pub struct TestHarness {
    /// Shared backend.
    pub storage: Arc<dyn Storage>,
    /// Work queue.
    pub queue: Arc<InMemoryJobQueue>,
    /// Audit events emitted by orchestrators built here.
    pub events: Arc<CollectingEventSink>,
    collaborators: BTreeMap<String, Arc<ScriptedCollaborator>>,
    dependencies: BTreeMap<String, Vec<String>>,
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("backend", &self.storage.backend_name())
            .field("stages", &self.collaborators.keys().collect::<Vec<_>>())
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl TestHarness {
    /// Harness over fresh in-memory storage with one collaborator per stage.
    #[must_use]
    pub fn new(stages: &[&str]) -> Self {
        Self::with_storage(Arc::new(InMemoryStorage::new()), stages)
    }

    /// Harness over `storage`.
    #[must_use]
    pub fn with_storage(storage: Arc<dyn Storage>, stages: &[&str]) -> Self {
        Self {
            storage,
            queue: Arc::new(InMemoryJobQueue::new("jobs", QueueConfig::default())),
            events: Arc::new(CollectingEventSink::new()),
            collaborators: stages
                .iter()
                .map(|stage| ((*stage).to_string(), Arc::new(ScriptedCollaborator::new())))
                .collect(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Declares dependencies of `stage`.
    #[must_use]
    pub fn with_dependencies(mut self, stage: &str, dependencies: &[&str]) -> Self {
        self.dependencies.insert(
            stage.to_string(),
            dependencies.iter().map(|d| (*d).to_string()).collect(),
        );
        self
    }

    /// Replaces the collaborator of `stage`.
    pub fn set_collaborator(&mut self, stage: &str, collaborator: ScriptedCollaborator) {
        self.collaborators
            .insert(stage.to_string(), Arc::new(collaborator));
    }

    /// The collaborator of `stage`.
    ///
    /// # Panics
    ///
    /// Panics if the stage was not declared.
    #[must_use]
    pub fn collaborator(&self, stage: &str) -> Arc<ScriptedCollaborator> {
        self.collaborators
            .get(stage)
            .cloned()
            .unwrap_or_else(|| panic!("stage '{stage}' is not part of the harness"))
    }

    /// Registry binding every stage to its collaborator.
    #[must_use]
    pub fn registry(&self) -> StageRegistry {
        self.collaborators
            .iter()
            .fold(StageRegistry::new(), |registry, (stage, collaborator)| {
                let definition = StageDefinition::new(stage.clone())
                    .with_dependencies(self.dependencies.get(stage).cloned().unwrap_or_default());
                registry.with_stage(definition, collaborator.clone())
            })
    }

    /// Job store over the shared backend.
    #[must_use]
    pub fn jobs(&self) -> JobStore {
        JobStore::new(self.storage.clone())
    }

    /// Checkpoint store over the shared backend.
    #[must_use]
    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.storage.clone())
    }

    /// Orchestrator over the shared backend.
    #[must_use]
    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_on(self.storage.clone())
    }

    /// Orchestrator over another view of the backend (a faulty wrapper, say).
    #[must_use]
    pub fn orchestrator_on(&self, storage: Arc<dyn Storage>) -> Orchestrator {
        let executor = StageExecutor::new(Arc::new(self.registry()), CheckpointStore::new(storage.clone()))
            .with_retry(fast_retry());
        Orchestrator::new(JobStore::new(storage), executor).with_events(self.events.clone())
    }

    /// Persists and enqueues a job with `plan`.
    ///
    /// # Panics
    ///
    /// Panics if the job cannot be created.
    pub async fn submit(&self, plan: &[&str]) -> Job {
        let job = Job::new(
            JobKey::generate("acme", "client-1").expect("valid key segments"),
            JobInput::new(BlobRef::new("inputs/doc.pdf")),
            "custom",
            plan.iter().map(|s| (*s).to_string()).collect(),
            30,
        )
        .expect("valid plan");
        self.jobs().create(&job).await.expect("job created");
        self.queue
            .enqueue(JobMessage::for_job(&job.key))
            .await
            .expect("job enqueued");
        job
    }

    /// Total collaborator invocations across all stages.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.collaborators.values().map(|c| c.call_count()).sum()
    }
}
