//! Table names and secondary index declarations.

use serde::{Deserialize, Serialize};

/// Job records, keyed by `tenant#client#job_id`.
pub const JOBS_TABLE: &str = "jobs";

/// Checkpoint records, keyed by `job_id#stage#version`.
pub const CHECKPOINTS_TABLE: &str = "checkpoints";

/// Audit events, keyed by `job_id#timestamp#event_id`.
pub const EVENTS_TABLE: &str = "processing_events";

/// Declaration of a secondary index over a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name.
    pub name: String,
    /// Top-level field records are grouped by.
    pub partition_field: String,
    /// Top-level field records are ordered by within a partition.
    pub sort_field: String,
}

impl IndexSpec {
    /// Creates an index declaration.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        partition_field: impl Into<String>,
        sort_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            partition_field: partition_field.into(),
            sort_field: sort_field.into(),
        }
    }

    /// Jobs by lifecycle status, oldest first.
    #[must_use]
    pub fn jobs_by_status() -> Self {
        Self::new("by_status", "status", "created_at")
    }

    /// Jobs by `tenant#client` owner.
    #[must_use]
    pub fn jobs_by_owner() -> Self {
        Self::new("by_owner", "owner", "created_at")
    }

    /// Checkpoints of one job in write order.
    #[must_use]
    pub fn checkpoints_by_job() -> Self {
        Self::new("by_job", "job_id", "created_at")
    }
}

/// A lookup against an [`IndexSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexQuery {
    /// Partition value to match.
    pub partition: serde_json::Value,
    /// Return records newest-first.
    #[serde(default)]
    pub descending: bool,
    /// Maximum number of records.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl IndexQuery {
    /// Matches every record in `partition`, ascending.
    #[must_use]
    pub fn new(partition: impl Into<serde_json::Value>) -> Self {
        Self {
            partition: partition.into(),
            descending: false,
            limit: None,
        }
    }

    /// Orders results by descending sort key.
    #[must_use]
    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Caps the number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
