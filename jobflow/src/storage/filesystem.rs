//! Filesystem storage backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/<key>                      raw blob bytes
//! tables/<table>/<hex(key)>.json   one JSON document per record
//! ```
//!
//! Every write goes to a temporary file that is synced and then renamed over
//! the destination, so readers never see a partially written file and a
//! write that returned survives a crash.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{
    apply_index, validate_blob_key, validate_record_key, IndexQuery, IndexSpec, Record, Storage,
    WriteCondition,
};
use crate::core::BlobRef;
use crate::errors::{JobflowError, NotFoundError, Result};

const RECORD_EXTENSION: &str = "json";

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
    table_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl FilesystemStorage {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("blobs")).await?;
        tokio::fs::create_dir_all(root.join("tables")).await?;
        Ok(Self {
            root,
            table_locks: Arc::new(DashMap::new()),
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.join("blobs"), |path, segment| path.join(segment))
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join("tables").join(table)
    }

    fn record_path(&self, table: &str, key: &str) -> PathBuf {
        self.table_dir(table)
            .join(format!("{}.{RECORD_EXTENSION}", encode_record_key(key)))
    }

    fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        self.table_locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_record(&self, path: &Path) -> Result<Option<Record>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_table(&self, table: &str) -> Result<Vec<(String, Record)>> {
        let mut entries = match tokio::fs::read_dir(self.table_dir(table)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut rows = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_record_key)
            else {
                tracing::warn!(path = %path.display(), "Skipping record with undecodable file name");
                continue;
            };
            if let Some(record) = self.read_record(&path).await? {
                rows.push((key, record));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}

/// Hex-encodes a record key so any character is safe in a file name.
fn encode_record_key(key: &str) -> String {
    hex::encode(key.as_bytes())
}

fn decode_record_key(encoded: &str) -> Option<String> {
    hex::decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Writes `bytes` to `path` via a synced temporary file and a rename, then
/// syncs the directory so the rename itself survives a power loss.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| JobflowError::storage(format!("no parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
        crate::utils::generate_uuid().simple()
    );
    let tmp_path = parent.join(tmp_name);
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    sync_dir(parent).await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

// Directories cannot be opened as files here; the rename is as durable as
// the platform makes it.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl Storage for FilesystemStorage {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef> {
        validate_blob_key(key)?;
        write_atomic(&self.blob_path(key), &bytes).await?;
        Ok(BlobRef::new(key))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        validate_blob_key(blob.as_str())?;
        match tokio::fs::read(self.blob_path(blob.as_str())).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(NotFoundError::new(format!("blob {blob}")).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, blob: &BlobRef) -> Result<bool> {
        validate_blob_key(blob.as_str())?;
        Ok(tokio::fs::try_exists(self.blob_path(blob.as_str())).await?)
    }

    async fn retrieval_url(&self, blob: &BlobRef, ttl: Duration) -> Result<String> {
        if !self.exists(blob).await? {
            return Err(NotFoundError::new(format!("blob {blob}")).into());
        }
        let path = tokio::fs::canonicalize(self.blob_path(blob.as_str())).await?;
        let expires = chrono::Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        Ok(format!("file://{}?expires={expires}", path.display()))
    }

    async fn put_record(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: WriteCondition,
    ) -> Result<()> {
        validate_record_key(table, key)?;
        let path = self.record_path(table, key);
        let bytes = serde_json::to_vec(&record)?;

        let lock = self.table_lock(table);
        let _guard = lock.lock().await;
        if condition != WriteCondition::Always {
            let existing = self.read_record(&path).await?;
            condition.check(table, key, existing.as_ref())?;
        }
        write_atomic(&path, &bytes).await
    }

    async fn get_record(&self, table: &str, key: &str) -> Result<Record> {
        validate_record_key(table, key)?;
        self.read_record(&self.record_path(table, key))
            .await?
            .ok_or_else(|| NotFoundError::new(format!("{table}/{key}")).into())
    }

    async fn delete_record(&self, table: &str, key: &str) -> Result<()> {
        validate_record_key(table, key)?;
        let lock = self.table_lock(table);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.record_path(table, key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn query_by_index(
        &self,
        table: &str,
        index: &IndexSpec,
        query: &IndexQuery,
    ) -> Result<Vec<Record>> {
        let rows = self.read_table(table).await?;
        Ok(apply_index(rows.into_iter().map(|(_, record)| record), index, query))
    }

    async fn scan_records(&self, table: &str) -> Result<Vec<(String, Record)>> {
        self.read_table(table).await
    }
}
