//! Retention sweep over records that carry an `expires_at` field.
//!
//! Job records are only removed once they are terminal; an expired job that
//! is still queued or processing stays until it settles.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::schema::{CHECKPOINTS_TABLE, EVENTS_TABLE, JOBS_TABLE};
use super::{Record, Storage};
use crate::core::JobStatus;
use crate::errors::Result;
use crate::utils::{is_expired, Timestamp};

/// Deletes expired records from the jobflow tables.
#[derive(Clone)]
pub struct RetentionSweeper {
    storage: Arc<dyn Storage>,
    tables: Vec<String>,
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl RetentionSweeper {
    /// Sweeps the job, checkpoint and event tables.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            tables: [JOBS_TABLE, CHECKPOINTS_TABLE, EVENTS_TABLE]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Restricts the sweep to `tables`.
    #[must_use]
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Removes every record expired at `now`; returns how many were deleted.
    ///
    /// Checkpoint versions of one stage go together: a chain is only removed
    /// once every version in it has expired, so surviving chains always
    /// start at version 1.
    pub async fn sweep(&self, now: &Timestamp) -> Result<usize> {
        let mut deleted = 0;
        for table in &self.tables {
            let records = self.storage.scan_records(table).await?;
            let doomed = if table == CHECKPOINTS_TABLE {
                expired_chains(records, now)
            } else {
                records
                    .into_iter()
                    .filter(|(_, record)| is_sweepable(table, record, now))
                    .map(|(key, _)| key)
                    .collect()
            };
            for key in doomed {
                self.storage.delete_record(table, &key).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, "Expired records removed");
        }
        Ok(deleted)
    }
}

fn expired_chains(records: Vec<(String, Record)>, now: &Timestamp) -> Vec<String> {
    let mut chains: BTreeMap<String, (bool, Vec<String>)> = BTreeMap::new();
    for (key, record) in records {
        let chain = key.rsplit_once('#').map_or(key.as_str(), |(chain, _)| chain).to_string();
        let entry = chains.entry(chain).or_insert((true, Vec::new()));
        entry.0 &= is_sweepable(CHECKPOINTS_TABLE, &record, now);
        entry.1.push(key);
    }
    chains
        .into_values()
        .filter(|(expired, _)| *expired)
        .flat_map(|(_, keys)| keys)
        .collect()
}

fn is_sweepable(table: &str, record: &Record, now: &Timestamp) -> bool {
    let expired = record
        .get("expires_at")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|at| is_expired(at, now));
    if !expired {
        return false;
    }
    if table != JOBS_TABLE {
        return true;
    }
    record
        .get("status")
        .cloned()
        .and_then(|status| serde_json::from_value::<JobStatus>(status).ok())
        .is_some_and(|status| status.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, WriteCondition};
    use crate::utils::{days_from_now, now_utc};
    use serde_json::json;

    const PAST: &str = "2020-01-01T00:00:00.000000+00:00";

    async fn put(storage: &dyn Storage, table: &str, key: &str, record: Record) {
        storage
            .put_record(table, key, record, WriteCondition::Always)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_records() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        put(storage.as_ref(), CHECKPOINTS_TABLE, "j#a#1", json!({"expires_at": PAST})).await;
        put(
            storage.as_ref(),
            CHECKPOINTS_TABLE,
            "j#b#1",
            json!({"expires_at": days_from_now(1)}),
        )
        .await;
        put(storage.as_ref(), EVENTS_TABLE, "j#e", json!({"expires_at": PAST})).await;
        put(storage.as_ref(), EVENTS_TABLE, "j#f", json!({"note": "no expiry"})).await;

        let sweeper = RetentionSweeper::new(storage.clone());
        assert_eq!(sweeper.sweep(&now_utc()).await.unwrap(), 2);

        let left = storage.scan_records(CHECKPOINTS_TABLE).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "j#b#1");
        assert_eq!(storage.scan_records(EVENTS_TABLE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_chain_kept_until_every_version_expires() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        put(storage.as_ref(), CHECKPOINTS_TABLE, "j#a#1", json!({"expires_at": PAST})).await;
        put(
            storage.as_ref(),
            CHECKPOINTS_TABLE,
            "j#a#2",
            json!({"expires_at": days_from_now(1)}),
        )
        .await;
        put(storage.as_ref(), CHECKPOINTS_TABLE, "j#b#1", json!({"expires_at": PAST})).await;
        put(storage.as_ref(), CHECKPOINTS_TABLE, "j#b#2", json!({"expires_at": PAST})).await;

        let sweeper = RetentionSweeper::new(storage.clone()).with_tables([CHECKPOINTS_TABLE]);
        assert_eq!(sweeper.sweep(&now_utc()).await.unwrap(), 2);

        let mut left: Vec<_> = storage
            .scan_records(CHECKPOINTS_TABLE)
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        left.sort();
        assert_eq!(left, vec!["j#a#1".to_string(), "j#a#2".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_keeps_unsettled_jobs() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        put(
            storage.as_ref(),
            JOBS_TABLE,
            "t#c#done",
            json!({"status": "completed", "expires_at": PAST}),
        )
        .await;
        put(
            storage.as_ref(),
            JOBS_TABLE,
            "t#c#running",
            json!({"status": "processing", "expires_at": PAST}),
        )
        .await;

        let sweeper = RetentionSweeper::new(storage.clone()).with_tables([JOBS_TABLE]);
        assert_eq!(sweeper.sweep(&now_utc()).await.unwrap(), 1);

        let left = storage.scan_records(JOBS_TABLE).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "t#c#running");
    }
}
