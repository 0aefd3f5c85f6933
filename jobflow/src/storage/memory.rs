//! Process-local storage backend.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::{
    apply_index, validate_blob_key, validate_record_key, IndexQuery, IndexSpec, Record, Storage,
    WriteCondition,
};
use crate::core::BlobRef;
use crate::errors::{NotFoundError, Result};

type Table = BTreeMap<String, Record>;

/// In-memory storage with the same semantics as the durable backends.
///
/// Conditional writes are evaluated and applied under one lock, so the
/// backend is safe to share between concurrent workers in one process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    blobs: Arc<DashMap<String, Vec<u8>>>,
    tables: Arc<Mutex<HashMap<String, Table>>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Number of records in `table`.
    #[must_use]
    pub fn record_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef> {
        validate_blob_key(key)?;
        self.blobs.insert(key.to_string(), bytes);
        Ok(BlobRef::new(key))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.blobs
            .get(blob.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NotFoundError::new(format!("blob {blob}")).into())
    }

    async fn exists(&self, blob: &BlobRef) -> Result<bool> {
        Ok(self.blobs.contains_key(blob.as_str()))
    }

    async fn retrieval_url(&self, blob: &BlobRef, ttl: Duration) -> Result<String> {
        if !self.blobs.contains_key(blob.as_str()) {
            return Err(NotFoundError::new(format!("blob {blob}")).into());
        }
        let expires = chrono::Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        Ok(format!("memory://{blob}?expires={expires}"))
    }

    async fn put_record(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: WriteCondition,
    ) -> Result<()> {
        validate_record_key(table, key)?;
        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        condition.check(table, key, rows.get(key))?;
        rows.insert(key.to_string(), record);
        Ok(())
    }

    async fn get_record(&self, table: &str, key: &str) -> Result<Record> {
        self.tables
            .lock()
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
            .ok_or_else(|| NotFoundError::new(format!("{table}/{key}")).into())
    }

    async fn delete_record(&self, table: &str, key: &str) -> Result<()> {
        if let Some(rows) = self.tables.lock().get_mut(table) {
            rows.remove(key);
        }
        Ok(())
    }

    async fn query_by_index(
        &self,
        table: &str,
        index: &IndexSpec,
        query: &IndexQuery,
    ) -> Result<Vec<Record>> {
        let rows: Vec<Record> = self
            .tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(apply_index(rows, index, query))
    }

    async fn scan_records(&self, table: &str) -> Result<Vec<(String, Record)>> {
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}
