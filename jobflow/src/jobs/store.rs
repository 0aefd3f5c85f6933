//! Job record persistence with optimistic locking.

use std::sync::Arc;

use crate::core::{Job, JobKey, JobStatus};
use crate::errors::Result;
use crate::storage::schema::JOBS_TABLE;
use crate::storage::{IndexQuery, IndexSpec, Storage, WriteCondition};
use crate::utils::next_after;

/// Reads and writes job records.
///
/// Every update is conditional on the `updated_at` value the caller loaded,
/// so two workers racing on one job cannot both advance it: the loser sees
/// a `ConflictError`.
#[derive(Clone)]
pub struct JobStore {
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("backend", &self.storage.backend_name())
            .finish()
    }
}

impl JobStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Persists a new job. Fails with a conflict if the key is taken.
    pub async fn create(&self, job: &Job) -> Result<()> {
        job.check_invariants()?;
        let record = serde_json::to_value(job)?;
        self.storage
            .put_record(JOBS_TABLE, &job.key.to_string(), record, WriteCondition::MustNotExist)
            .await?;
        tracing::info!(job_key = %job.key, pipeline = %job.pipeline, "Job created");
        Ok(())
    }

    /// Loads a job.
    pub async fn get(&self, key: &JobKey) -> Result<Job> {
        let record = self.storage.get_record(JOBS_TABLE, &key.to_string()).await?;
        Ok(serde_json::from_value(record)?)
    }

    /// Loads a job, mapping absence to `None`.
    pub async fn find(&self, key: &JobKey) -> Result<Option<Job>> {
        match self.get(key).await {
            Ok(job) => Ok(Some(job)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Writes `job` if nobody changed it since it was loaded.
    ///
    /// The expected token is `job.updated_at` as loaded; on success the
    /// record and `job.updated_at` carry a strictly later timestamp. On
    /// failure `job.updated_at` is left untouched.
    pub async fn update(&self, job: &mut Job) -> Result<()> {
        job.check_invariants()?;
        let expected = job.updated_at.clone();
        let next = next_after(&expected);

        job.updated_at = next;
        let record = serde_json::to_value(&*job)?;
        let result = self
            .storage
            .put_record(
                JOBS_TABLE,
                &job.key.to_string(),
                record,
                WriteCondition::field_equals("updated_at", expected.clone()),
            )
            .await;

        if let Err(err) = result {
            job.updated_at = expected;
            if err.is_conflict() {
                tracing::debug!(job_key = %job.key, "Job update lost optimistic lock");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Jobs in `status`, oldest first.
    pub async fn list_by_status(&self, status: JobStatus, limit: Option<usize>) -> Result<Vec<Job>> {
        let mut query = IndexQuery::new(status.as_str());
        if let Some(limit) = limit {
            query = query.with_limit(limit);
        }
        self.query(&IndexSpec::jobs_by_status(), &query).await
    }

    /// Jobs of one `tenant#client` owner, newest first.
    pub async fn list_by_owner(&self, owner: &str, limit: Option<usize>) -> Result<Vec<Job>> {
        let mut query = IndexQuery::new(owner).descending();
        if let Some(limit) = limit {
            query = query.with_limit(limit);
        }
        self.query(&IndexSpec::jobs_by_owner(), &query).await
    }

    async fn query(&self, index: &IndexSpec, query: &IndexQuery) -> Result<Vec<Job>> {
        let records = self.storage.query_by_index(JOBS_TABLE, index, query).await?;
        records
            .into_iter()
            .map(|record| serde_json::from_value::<Job>(record).map_err(Into::into))
            .collect()
    }
}
