//! Storage abstraction: blobs plus structured records.
//!
//! Every backend exposes the same contract:
//! - `put`/`get` for opaque byte blobs addressed by `/`-separated keys
//! - `put_record`/`get_record` for JSON records with conditional writes
//! - `query_by_index` over secondary indexes declared as [`IndexSpec`]s
//!
//! Backends share the error taxonomy in [`crate::errors`]: a failed write
//! condition is a `ConflictError`, a missing item is a `NotFoundError`, and
//! everything else is a storage error. All writes are durable before they
//! return.

mod filesystem;
mod memory;
#[cfg(feature = "remote")]
mod remote;
mod retention;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::BlobRef;
use crate::errors::{ConflictError, JobflowError, Result};

pub use filesystem::FilesystemStorage;
pub use memory::InMemoryStorage;
#[cfg(feature = "remote")]
pub use remote::RemoteStorage;
pub use retention::RetentionSweeper;
pub use schema::{IndexQuery, IndexSpec};

/// A structured record as stored by a backend.
pub type Record = serde_json::Value;

/// Precondition attached to a record write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteCondition {
    /// Write unconditionally.
    Always,
    /// Write only if no record exists under the key.
    MustNotExist,
    /// Write only if the stored record's top-level `field` equals `expected`.
    ///
    /// A missing record fails the condition.
    FieldEquals {
        /// Top-level field name.
        field: String,
        /// Expected JSON value.
        expected: serde_json::Value,
    },
}

impl WriteCondition {
    /// Shorthand for a `FieldEquals` condition.
    #[must_use]
    pub fn field_equals(field: impl Into<String>, expected: impl Into<serde_json::Value>) -> Self {
        Self::FieldEquals {
            field: field.into(),
            expected: expected.into(),
        }
    }

    /// Evaluates the condition against the currently stored record.
    pub fn check(&self, table: &str, key: &str, existing: Option<&Record>) -> Result<()> {
        match (self, existing) {
            (Self::Always, _) | (Self::MustNotExist, None) => Ok(()),
            (Self::MustNotExist, Some(_)) => {
                Err(ConflictError::new(table, key, "record already exists").into())
            }
            (Self::FieldEquals { field, .. }, None) => Err(ConflictError::new(
                table,
                key,
                format!("record missing, expected '{field}' to match"),
            )
            .into()),
            (Self::FieldEquals { field, expected }, Some(record)) => {
                let actual = record.get(field).unwrap_or(&serde_json::Value::Null);
                if actual == expected {
                    Ok(())
                } else {
                    Err(ConflictError::new(
                        table,
                        key,
                        format!("'{field}' is {actual}, expected {expected}"),
                    )
                    .into())
                }
            }
        }
    }
}

/// Uniform blob and record operations.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Stores `bytes` under `key` and returns a reference to it.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef>;

    /// Reads a blob.
    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>>;

    /// Returns true if the blob exists.
    async fn exists(&self, blob: &BlobRef) -> Result<bool>;

    /// Returns a pointer that grants read access to the blob for `ttl`.
    async fn retrieval_url(&self, blob: &BlobRef, ttl: Duration) -> Result<String>;

    /// Writes a record if `condition` holds for the stored value.
    async fn put_record(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: WriteCondition,
    ) -> Result<()>;

    /// Reads a record.
    async fn get_record(&self, table: &str, key: &str) -> Result<Record>;

    /// Deletes a record. Deleting a missing record is not an error.
    async fn delete_record(&self, table: &str, key: &str) -> Result<()>;

    /// Queries a secondary index.
    async fn query_by_index(
        &self,
        table: &str,
        index: &IndexSpec,
        query: &IndexQuery,
    ) -> Result<Vec<Record>>;

    /// Lists every `(key, record)` pair in a table.
    async fn scan_records(&self, table: &str) -> Result<Vec<(String, Record)>>;
}

/// Backend selection, constructed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local storage.
    #[default]
    Memory,
    /// Files under a root directory.
    Filesystem {
        /// Root directory.
        root: PathBuf,
    },
    /// HTTP object and table service.
    Remote {
        /// Service base URL.
        base_url: String,
        /// Per-request timeout in milliseconds.
        #[serde(default = "default_remote_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_remote_timeout_ms() -> u64 {
    10_000
}

/// Builds the backend described by `config`.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Memory => Arc::new(InMemoryStorage::new()),
        StorageConfig::Filesystem { root } => Arc::new(FilesystemStorage::open(root).await?),
        #[cfg(feature = "remote")]
        StorageConfig::Remote { base_url, timeout_ms } => Arc::new(RemoteStorage::new(
            base_url.clone(),
            Duration::from_millis(*timeout_ms),
        )?),
        #[cfg(not(feature = "remote"))]
        StorageConfig::Remote { .. } => {
            return Err(JobflowError::Config(
                "remote storage requires the 'remote' feature".to_string(),
            ))
        }
    };
    tracing::info!(backend = storage.backend_name(), "Storage backend connected");
    Ok(storage)
}

/// Rejects blob keys that could escape the backend's namespace.
pub(crate) fn validate_blob_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(JobflowError::storage(format!("invalid blob key '{key}'")))
    }
}

pub(crate) fn validate_record_key(table: &str, key: &str) -> Result<()> {
    if table.is_empty() || table.contains('/') || key.is_empty() {
        return Err(JobflowError::storage(format!("invalid record address {table}/{key}")));
    }
    Ok(())
}

/// Applies an index query to an unordered set of records.
///
/// Used by backends without native secondary indexes.
pub(crate) fn apply_index<I>(records: I, index: &IndexSpec, query: &IndexQuery) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut matched: Vec<Record> = records
        .into_iter()
        .filter(|record| record.get(&index.partition_field) == Some(&query.partition))
        .collect();

    matched.sort_by(|a, b| {
        let ordering = compare_values(a.get(&index.sort_field), b.get(&index.sort_field));
        if query.descending {
            ordering.reverse()
        } else {
            ordering
        }
    });

    if let Some(limit) = query.limit {
        matched.truncate(limit);
    }
    matched
}

fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}
