//! Checkpoint record type.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::job::BlobRef;

/// Durable snapshot of one stage's output for one job.
///
/// Immutable once written. Identity is `(job_id, stage, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning job.
    pub job_id: String,
    /// Stage that produced the payload.
    pub stage: String,
    /// Version, starting at 1.
    pub version: u32,
    /// Job generation that produced the payload.
    pub generation: u32,
    /// When the checkpoint was written.
    pub created_at: String,
    /// Where the payload blob lives.
    pub data_ref: BlobRef,
    /// SHA-256 hex digest of the payload bytes.
    pub content_hash: String,
    /// Payload length.
    pub size_bytes: u64,
    /// Artifacts the stage produced, merged into the job on completion.
    #[serde(default)]
    pub output_refs: BTreeMap<String, BlobRef>,
    /// Stage-supplied metadata (duration, attempts, model).
    #[serde(default)]
    pub stage_metadata: HashMap<String, serde_json::Value>,
    /// Retention deadline.
    pub expires_at: String,
}

impl Checkpoint {
    /// Record key for a checkpoint: `job_id#stage#000001`.
    ///
    /// The zero padding keeps versions of one stage in numeric order when
    /// keys are compared as strings.
    #[must_use]
    pub fn record_key(job_id: &str, stage: &str, version: u32) -> String {
        format!("{job_id}#{stage}#{version:06}")
    }

    /// Record key of this checkpoint.
    #[must_use]
    pub fn key(&self) -> String {
        Self::record_key(&self.job_id, &self.stage, self.version)
    }

    /// Blob path of a checkpoint payload.
    ///
    /// Includes a digest prefix so concurrent writers of the same version
    /// never overwrite each other's payload.
    #[must_use]
    pub fn payload_path(job_id: &str, stage: &str, version: u32, content_hash: &str) -> String {
        let digest = &content_hash[..content_hash.len().min(16)];
        format!("checkpoints/{job_id}/{stage}/v{version:06}-{digest}.json")
    }

    /// Reads a metadata value.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.stage_metadata.get(key)
    }
}
