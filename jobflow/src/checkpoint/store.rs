//! Versioned, stage-keyed checkpoint persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::core::{BlobRef, Checkpoint};
use crate::errors::{DuplicateCheckpointError, JobflowError, NotFoundError, Result};
use crate::storage::schema::CHECKPOINTS_TABLE;
use crate::storage::{IndexQuery, IndexSpec, Storage, WriteCondition};
use crate::utils::{content_hash, days_from_now, iso_timestamp};

/// Default checkpoint retention.
pub const DEFAULT_CHECKPOINT_RETENTION_DAYS: i64 = 30;

/// What a stage hands over to be checkpointed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointWrite {
    /// Serialized stage output.
    pub payload: Vec<u8>,
    /// Artifacts produced by the stage.
    pub output_refs: BTreeMap<String, BlobRef>,
    /// Stage metadata (duration, attempts, model).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CheckpointWrite {
    /// Creates a write carrying only a payload.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Adds an artifact reference.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, blob: BlobRef) -> Self {
        self.output_refs.insert(name.into(), blob);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Persists stage outputs as immutable, versioned checkpoints.
///
/// Versions advance only across job generations. Saving again within the
/// generation that already produced a checkpoint targets the same version
/// and reports [`DuplicateCheckpointError`] carrying the stored checkpoint,
/// which callers treat as success.
#[derive(Clone)]
pub struct CheckpointStore {
    storage: Arc<dyn Storage>,
    retention_days: i64,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("backend", &self.storage.backend_name())
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl CheckpointStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            retention_days: DEFAULT_CHECKPOINT_RETENTION_DAYS,
        }
    }

    /// Overrides the retention window.
    #[must_use]
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Saves `write` as the output of `stage` for `job_id`.
    ///
    /// The payload blob is written first and the record second, under a
    /// `MustNotExist` condition on `(job_id, stage, version)`. The blob path
    /// includes the payload digest, so a losing concurrent writer never
    /// overwrites the winner's payload.
    pub async fn save(
        &self,
        job_id: &str,
        stage: &str,
        generation: u32,
        write: CheckpointWrite,
    ) -> Result<Checkpoint> {
        let version = match self.find_latest(job_id, stage).await? {
            Some(latest) if latest.generation == generation => {
                tracing::debug!(
                    job_id,
                    stage,
                    version = latest.version,
                    "Checkpoint already written for this generation"
                );
                return Err(DuplicateCheckpointError {
                    job_id: job_id.to_string(),
                    stage: stage.to_string(),
                    version: latest.version,
                    existing: Some(latest),
                }
                .into());
            }
            Some(latest) => latest.version + 1,
            None => 1,
        };

        let CheckpointWrite {
            payload,
            output_refs,
            metadata,
        } = write;
        let hash = content_hash(&payload);
        let size_bytes = payload.len() as u64;
        let blob_key = Checkpoint::payload_path(job_id, stage, version, &hash);
        let data_ref = self.storage.put(&blob_key, payload).await?;

        let checkpoint = Checkpoint {
            job_id: job_id.to_string(),
            stage: stage.to_string(),
            version,
            generation,
            created_at: iso_timestamp(),
            data_ref,
            content_hash: hash,
            size_bytes,
            output_refs,
            stage_metadata: metadata,
            expires_at: days_from_now(self.retention_days),
        };

        let key = checkpoint.key();
        let record = serde_json::to_value(&checkpoint)?;
        match self
            .storage
            .put_record(CHECKPOINTS_TABLE, &key, record, WriteCondition::MustNotExist)
            .await
        {
            Ok(()) => {
                tracing::info!(job_id, stage, version, generation, "Checkpoint saved");
                Ok(checkpoint)
            }
            Err(JobflowError::Conflict(_)) => {
                let existing = self.load_version(job_id, stage, version).await.ok();
                Err(DuplicateCheckpointError {
                    job_id: job_id.to_string(),
                    stage: stage.to_string(),
                    version,
                    existing,
                }
                .into())
            }
            Err(err) => Err(err),
        }
    }

    /// Loads one specific version.
    pub async fn load_version(&self, job_id: &str, stage: &str, version: u32) -> Result<Checkpoint> {
        let record = self
            .storage
            .get_record(CHECKPOINTS_TABLE, &Checkpoint::record_key(job_id, stage, version))
            .await?;
        Ok(serde_json::from_value(record)?)
    }

    /// Loads the authoritative (highest version) checkpoint of a stage.
    pub async fn load_latest(&self, job_id: &str, stage: &str) -> Result<Checkpoint> {
        self.find_latest(job_id, stage)
            .await?
            .ok_or_else(|| NotFoundError::new(format!("checkpoint {job_id}/{stage}")).into())
    }

    /// Like [`load_latest`](Self::load_latest) but absent is `None`.
    ///
    /// Versions of a stage are contiguous from 1, so this walks them by key
    /// until the first gap instead of querying the job index.
    pub async fn find_latest(&self, job_id: &str, stage: &str) -> Result<Option<Checkpoint>> {
        let mut latest = None;
        for version in 1u32.. {
            match self.load_version(job_id, stage, version).await {
                Ok(checkpoint) => latest = Some(checkpoint),
                Err(err) if err.is_not_found() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(latest)
    }

    /// Loads every checkpoint of a job in write order, oldest first.
    pub async fn load_all(&self, job_id: &str) -> Result<Vec<Checkpoint>> {
        let records = self
            .storage
            .query_by_index(
                CHECKPOINTS_TABLE,
                &IndexSpec::checkpoints_by_job(),
                &IndexQuery::new(job_id),
            )
            .await?;

        let mut checkpoints = records
            .into_iter()
            .map(serde_json::from_value::<Checkpoint>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        checkpoints.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.version.cmp(&b.version))
        });
        Ok(checkpoints)
    }

    /// Reads a checkpoint payload and verifies its digest.
    pub async fn load_payload(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        let bytes = self.storage.get(&checkpoint.data_ref).await?;
        let actual = content_hash(&bytes);
        if actual != checkpoint.content_hash {
            tracing::error!(
                job_id = %checkpoint.job_id,
                stage = %checkpoint.stage,
                version = checkpoint.version,
                "Checkpoint payload failed integrity check"
            );
            return Err(JobflowError::storage(format!(
                "checkpoint {} payload hash mismatch (expected {}, got {actual})",
                checkpoint.key(),
                checkpoint.content_hash
            )));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use pretty_assertions::assert_eq;

    fn store() -> (Arc<InMemoryStorage>, CheckpointStore) {
        let storage = Arc::new(InMemoryStorage::new());
        (storage.clone(), CheckpointStore::new(storage))
    }

    #[tokio::test]
    async fn test_first_save_is_version_one() {
        let (_, store) = store();
        let cp = store.save("job_1", "extract", 1, CheckpointWrite::new(*b"{}")).await.unwrap();
        assert_eq!(cp.version, 1);
        assert_eq!(cp.size_bytes, 2);
        assert_eq!(store.load_latest("job_1", "extract").await.unwrap(), cp);
    }

    #[tokio::test]
    async fn test_double_save_same_generation_is_duplicate() {
        let (_, store) = store();
        let first = store.save("job_1", "extract", 1, CheckpointWrite::new(*b"first")).await.unwrap();

        let err = store
            .save("job_1", "extract", 1, CheckpointWrite::new(*b"second"))
            .await
            .unwrap_err();
        let JobflowError::DuplicateCheckpoint(dup) = err else {
            panic!("expected a duplicate checkpoint error");
        };
        assert_eq!(dup.version, 1);
        assert_eq!(dup.existing.as_ref(), Some(&first));

        let latest = store.load_latest("job_1", "extract").await.unwrap();
        assert_eq!(store.load_payload(&latest).await.unwrap(), b"first".to_vec());
    }

    #[tokio::test]
    async fn test_new_generation_bumps_version() {
        let (_, store) = store();
        store.save("job_1", "extract", 1, CheckpointWrite::new(*b"g1")).await.unwrap();
        let second = store.save("job_1", "extract", 2, CheckpointWrite::new(*b"g2")).await.unwrap();
        assert_eq!(second.version, 2);

        let latest = store.load_latest("job_1", "extract").await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(store.load_payload(&latest).await.unwrap(), b"g2".to_vec());
        assert_eq!(store.load_version("job_1", "extract", 1).await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_load_latest_missing() {
        let (_, store) = store();
        assert!(store.load_latest("job_1", "extract").await.unwrap_err().is_not_found());
        assert!(store.find_latest("job_1", "extract").await.unwrap().is_none());
    }

    /// Answers key lookups only; index queries and scans fail.
    struct KeyOnlyStorage(InMemoryStorage);

    #[async_trait::async_trait]
    impl Storage for KeyOnlyStorage {
        fn backend_name(&self) -> &'static str {
            "key-only"
        }

        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef> {
            self.0.put(key, bytes).await
        }

        async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
            self.0.get(blob).await
        }

        async fn exists(&self, blob: &BlobRef) -> Result<bool> {
            self.0.exists(blob).await
        }

        async fn retrieval_url(&self, blob: &BlobRef, ttl: std::time::Duration) -> Result<String> {
            self.0.retrieval_url(blob, ttl).await
        }

        async fn put_record(
            &self,
            table: &str,
            key: &str,
            record: crate::storage::Record,
            condition: WriteCondition,
        ) -> Result<()> {
            self.0.put_record(table, key, record, condition).await
        }

        async fn get_record(&self, table: &str, key: &str) -> Result<crate::storage::Record> {
            self.0.get_record(table, key).await
        }

        async fn delete_record(&self, table: &str, key: &str) -> Result<()> {
            self.0.delete_record(table, key).await
        }

        async fn query_by_index(
            &self,
            table: &str,
            _index: &IndexSpec,
            _query: &IndexQuery,
        ) -> Result<Vec<crate::storage::Record>> {
            Err(JobflowError::storage(format!("index query on {table}")))
        }

        async fn scan_records(&self, table: &str) -> Result<Vec<(String, crate::storage::Record)>> {
            Err(JobflowError::storage(format!("scan of {table}")))
        }
    }

    #[tokio::test]
    async fn test_latest_found_by_key_without_index() {
        let store = CheckpointStore::new(Arc::new(KeyOnlyStorage(InMemoryStorage::new())));
        assert!(store.find_latest("job_1", "extract").await.unwrap().is_none());

        for generation in 1..=3 {
            store
                .save("job_1", "extract", generation, CheckpointWrite::new(*b"out"))
                .await
                .unwrap();
        }
        store.save("job_1", "generate", 1, CheckpointWrite::new(*b"g")).await.unwrap();

        let latest = store.load_latest("job_1", "extract").await.unwrap();
        assert_eq!((latest.version, latest.generation), (3, 3));
        assert_eq!(store.load_latest("job_1", "generate").await.unwrap().version, 1);
        assert_eq!(store.load_all("job_1").await.unwrap_err().kind(), "storage");
    }

    #[tokio::test]
    async fn test_load_all_orders_by_write() {
        let (_, store) = store();
        store.save("job_1", "extract", 1, CheckpointWrite::new(*b"a")).await.unwrap();
        store.save("job_1", "generate", 1, CheckpointWrite::new(*b"b")).await.unwrap();
        store.save("job_2", "extract", 1, CheckpointWrite::new(*b"c")).await.unwrap();

        let stages: Vec<_> = store
            .load_all("job_1")
            .await
            .unwrap()
            .into_iter()
            .map(|cp| cp.stage)
            .collect();
        assert_eq!(stages, vec!["extract".to_string(), "generate".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupted_payload_detected() {
        let (storage, store) = store();
        let cp = store.save("job_1", "extract", 1, CheckpointWrite::new(*b"good")).await.unwrap();
        storage.put(cp.data_ref.as_str(), b"evil".to_vec()).await.unwrap();

        let err = store.load_payload(&cp).await.unwrap_err();
        assert_eq!(err.kind(), "storage");
    }

    #[tokio::test]
    async fn test_record_key_guards_version() {
        let (storage, store) = store();
        let winner = store.save("job_1", "extract", 1, CheckpointWrite::new(*b"winner")).await.unwrap();

        // A writer that read "no checkpoint" before the winner committed
        // still targets v1 and must lose on the record write.
        let record = serde_json::to_value(&winner).unwrap();
        let err = storage
            .put_record(CHECKPOINTS_TABLE, &winner.key(), record, WriteCondition::MustNotExist)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
