//! Storage wrapper that fails writes on demand.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::BlobRef;
use crate::errors::{JobflowError, Result};
use crate::storage::{IndexQuery, IndexSpec, Record, Storage, WriteCondition};

const NEVER: usize = usize::MAX;

/// Delegates to another backend, failing every write from the n-th on.
///
/// Simulates a worker crashing at an arbitrary point: writes before the
/// crash point are durable, nothing after it is.
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    writes: AtomicUsize,
    fail_from: AtomicUsize,
}

impl std::fmt::Debug for FaultyStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStorage")
            .field("backend", &self.inner.backend_name())
            .field("writes", &self.writes())
            .finish()
    }
}

impl FaultyStorage {
    /// Wraps `inner` without injecting faults.
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            fail_from: AtomicUsize::new(NEVER),
        }
    }

    /// Fails the write with zero-based index `n` and every later one.
    #[must_use]
    pub fn failing_from(self, n: usize) -> Self {
        self.fail_from.store(n, Ordering::SeqCst);
        self
    }

    /// Stops injecting faults.
    pub fn heal(&self) {
        self.fail_from.store(NEVER, Ordering::SeqCst);
    }

    /// Writes attempted so far, failed ones included.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn admit_write(&self, what: &str) -> Result<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_from.load(Ordering::SeqCst) {
            return Err(JobflowError::storage(format!("injected fault on write #{n} ({what})")));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    fn backend_name(&self) -> &'static str {
        "faulty"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef> {
        self.admit_write(key)?;
        self.inner.put(key, bytes).await
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.inner.get(blob).await
    }

    async fn exists(&self, blob: &BlobRef) -> Result<bool> {
        self.inner.exists(blob).await
    }

    async fn retrieval_url(&self, blob: &BlobRef, ttl: Duration) -> Result<String> {
        self.inner.retrieval_url(blob, ttl).await
    }

    async fn put_record(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: WriteCondition,
    ) -> Result<()> {
        self.admit_write(table)?;
        self.inner.put_record(table, key, record, condition).await
    }

    async fn get_record(&self, table: &str, key: &str) -> Result<Record> {
        self.inner.get_record(table, key).await
    }

    async fn delete_record(&self, table: &str, key: &str) -> Result<()> {
        self.admit_write(table)?;
        self.inner.delete_record(table, key).await
    }

    async fn query_by_index(
        &self,
        table: &str,
        index: &IndexSpec,
        query: &IndexQuery,
    ) -> Result<Vec<Record>> {
        self.inner.query_by_index(table, index, query).await
    }

    async fn scan_records(&self, table: &str) -> Result<Vec<(String, Record)>> {
        self.inner.scan_records(table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_fails_from_nth_write_until_healed() {
        let storage = FaultyStorage::new(Arc::new(InMemoryStorage::new())).failing_from(1);
        storage.put("a/1", b"x".to_vec()).await.unwrap();
        let err = storage.put("a/2", b"y".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(!storage.exists(&BlobRef::new("a/2")).await.unwrap());

        storage.heal();
        storage.put("a/2", b"y".to_vec()).await.unwrap();
        assert_eq!(storage.writes(), 3);
    }
}
