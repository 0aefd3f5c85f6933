//! Job identity, inputs and the lifecycle record.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use super::status::JobStatus;
use crate::errors::{IllegalTransitionError, JobFailure, ValidationError};
use crate::utils::{
    days_from_now, format_iso8601, generate_job_id, is_expired, is_valid_job_id, is_valid_segment,
    iso_timestamp, now_utc, Timestamp,
};

/// Separator between the segments of a composite job key.
pub const KEY_SEPARATOR: char = '#';

/// Opaque pointer to a blob held by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    /// Wraps a backend-issued reference.
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// The raw reference string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Composite identity of a job: `tenant#client#job_id`.
///
/// Serialized as the joined string so it can be used directly as a record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    /// Tenant (company) segment.
    pub tenant: String,
    /// Client segment within the tenant.
    pub client: String,
    /// Time-sortable job identifier.
    pub job_id: String,
}

impl JobKey {
    /// Builds a key from validated segments.
    pub fn new(
        tenant: impl Into<String>,
        client: impl Into<String>,
        job_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let key = Self {
            tenant: tenant.into(),
            client: client.into(),
            job_id: job_id.into(),
        };
        if !is_valid_segment(&key.tenant) {
            return Err(ValidationError::new("tenant", "must be a non-empty key segment"));
        }
        if !is_valid_segment(&key.client) {
            return Err(ValidationError::new("client", "must be a non-empty key segment"));
        }
        if !is_valid_job_id(&key.job_id) {
            return Err(ValidationError::new("job_id", format!("'{}' is not a job id", key.job_id)));
        }
        Ok(key)
    }

    /// Mints a fresh key for a new job.
    pub fn generate(tenant: impl Into<String>, client: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(tenant, client, generate_job_id())
    }

    /// Parses a composite `tenant#client#job_id` string.
    pub fn parse(composite: &str) -> Result<Self, ValidationError> {
        let mut parts = composite.splitn(3, KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(client), Some(job_id)) => Self::new(tenant, client, job_id),
            _ => Err(ValidationError::new(
                "job_key",
                format!("'{composite}' is not of the form tenant#client#job_id"),
            )),
        }
    }

    /// The `tenant#client` owner string used by the by-owner index.
    #[must_use]
    pub fn owner(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}", self.tenant, self.client)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.tenant, self.client, self.job_id
        )
    }
}

impl FromStr for JobKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for JobKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// References to the uploaded inputs of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    /// The primary document.
    pub primary: BlobRef,
    /// Optional secondary context document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BlobRef>,
    /// Caller-supplied metadata (file names, content types).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl JobInput {
    /// Creates input pointing at a primary document only.
    #[must_use]
    pub fn new(primary: BlobRef) -> Self {
        Self {
            primary,
            context: None,
            metadata: HashMap::new(),
        }
    }

    /// Attaches a secondary context document.
    #[must_use]
    pub fn with_context(mut self, context: BlobRef) -> Self {
        self.context = Some(context);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns true if a secondary context document was supplied.
    #[must_use]
    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }
}

/// Claim a running worker holds on a `processing` job.
///
/// The holder renews it while a stage runs; other workers leave the job
/// alone until it lapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLease {
    /// Run that holds the lease (its correlation id).
    pub holder: String,
    /// When the lease lapses unless renewed (RFC 3339).
    pub expires_at: String,
}

impl JobLease {
    /// Returns true if the lease has not lapsed at `now`.
    #[must_use]
    pub fn is_live(&self, now: &Timestamp) -> bool {
        !is_expired(&self.expires_at, now)
    }
}

/// The authoritative lifecycle record of one processing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Composite key.
    pub key: JobKey,
    /// `tenant#client`, duplicated for the by-owner index.
    pub owner: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Name of the pipeline the plan was built from.
    pub pipeline: String,
    /// Frozen ordered stage plan.
    pub stage_plan: Vec<String>,
    /// Append-only prefix of `stage_plan`.
    #[serde(default)]
    pub stages_completed: Vec<String>,
    /// Stage being executed, or the stage that failed.
    #[serde(default)]
    pub current_stage: Option<String>,
    /// Uploaded inputs.
    pub input_refs: JobInput,
    /// Artifacts produced so far, keyed by artifact name.
    #[serde(default)]
    pub output_refs: BTreeMap<String, BlobRef>,
    /// Structured failure, set only when `status` is `failed`.
    #[serde(default)]
    pub error: Option<JobFailure>,
    /// Deliberate re-run counter, starting at 1.
    pub generation: u32,
    /// Number of times a worker picked the job up.
    #[serde(default)]
    pub attempts: u32,
    /// Creation time (RFC 3339).
    pub created_at: String,
    /// Last modification time, also the optimistic-lock token.
    pub updated_at: String,
    /// Retention deadline.
    pub expires_at: String,
    /// Claim of the worker currently running the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<JobLease>,
}

impl Job {
    /// Creates a queued job with a frozen plan.
    pub fn new(
        key: JobKey,
        input_refs: JobInput,
        pipeline: impl Into<String>,
        stage_plan: Vec<String>,
        retention_days: i64,
    ) -> Result<Self, ValidationError> {
        if stage_plan.is_empty() {
            return Err(ValidationError::new("stage_plan", "must contain at least one stage"));
        }
        for (idx, stage) in stage_plan.iter().enumerate() {
            if stage_plan[..idx].contains(stage) {
                return Err(ValidationError::new(
                    "stage_plan",
                    format!("stage '{stage}' appears more than once"),
                ));
            }
        }

        let now = iso_timestamp();
        Ok(Self {
            owner: key.owner(),
            key,
            status: JobStatus::Queued,
            pipeline: pipeline.into(),
            stage_plan,
            stages_completed: Vec::new(),
            current_stage: None,
            input_refs,
            output_refs: BTreeMap::new(),
            error: None,
            generation: 1,
            attempts: 0,
            created_at: now.clone(),
            updated_at: now,
            expires_at: days_from_now(retention_days),
            lease: None,
        })
    }

    /// Returns true if the job is completed or failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The first plan entry not yet completed.
    #[must_use]
    pub fn next_stage(&self) -> Option<&str> {
        self.stage_plan
            .get(self.stages_completed.len())
            .map(String::as_str)
    }

    /// The stages still to run, in plan order.
    #[must_use]
    pub fn remaining_stages(&self) -> &[String] {
        let done = self.stages_completed.len().min(self.stage_plan.len());
        &self.stage_plan[done..]
    }

    /// The plan entry preceding `stage`, if any.
    #[must_use]
    pub fn predecessor_of(&self, stage: &str) -> Option<&str> {
        let idx = self.stage_plan.iter().position(|s| s == stage)?;
        idx.checked_sub(1).map(|prev| self.stage_plan[prev].as_str())
    }

    /// Verifies the structural invariants of the record.
    pub fn check_invariants(&self) -> Result<(), IllegalTransitionError> {
        let completed = self.stages_completed.len();
        if completed > self.stage_plan.len() || self.stage_plan[..completed] != self.stages_completed[..] {
            return Err(self.illegal("stages_completed is not a prefix of stage_plan"));
        }
        if let Some(current) = &self.current_stage {
            if self.next_stage() != Some(current.as_str()) {
                return Err(self.illegal(format!(
                    "current_stage '{current}' is not the stage after the completed prefix"
                )));
            }
        }
        match self.status {
            JobStatus::Completed if completed != self.stage_plan.len() => {
                Err(self.illegal("completed job has unfinished stages"))
            }
            JobStatus::Failed if self.error.is_none() => Err(self.illegal("failed job has no error")),
            _ => Ok(()),
        }
    }

    /// The live lease of a run other than `holder`, if any.
    #[must_use]
    pub fn leased_elsewhere(&self, holder: &str, now: &Timestamp) -> Option<&JobLease> {
        self.lease
            .as_ref()
            .filter(|lease| lease.holder != holder && lease.is_live(now))
    }

    /// Claims or renews the lease for `holder` until `ttl` from now.
    pub fn acquire_lease(&mut self, holder: &str, ttl: std::time::Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        self.lease = Some(JobLease {
            holder: holder.to_string(),
            expires_at: format_iso8601(&(now_utc() + ttl)),
        });
    }

    /// Drops any lease.
    pub fn release_lease(&mut self) {
        self.lease = None;
    }

    /// Records a pickup: `queued -> processing`, or a resumed `processing` job.
    pub fn begin_processing(&mut self) -> Result<(), IllegalTransitionError> {
        self.transition(JobStatus::Processing)?;
        self.current_stage = self.next_stage().map(str::to_string);
        self.attempts += 1;
        Ok(())
    }

    /// Appends `stage` to the completed prefix and merges its artifacts.
    ///
    /// Moves the job to `completed` once the whole plan is done.
    pub fn complete_stage(
        &mut self,
        stage: &str,
        outputs: BTreeMap<String, BlobRef>,
    ) -> Result<(), IllegalTransitionError> {
        if self.status != JobStatus::Processing {
            return Err(self.illegal(format!("cannot complete '{stage}' while {}", self.status)));
        }
        if self.next_stage() != Some(stage) {
            return Err(self.illegal(format!(
                "stage '{stage}' is not next in plan (expected {:?})",
                self.next_stage()
            )));
        }

        self.stages_completed.push(stage.to_string());
        self.output_refs.extend(outputs);
        self.current_stage = self.next_stage().map(str::to_string);
        if self.current_stage.is_none() {
            self.transition(JobStatus::Completed)?;
            self.lease = None;
        }
        Ok(())
    }

    /// Moves the job to `failed`, leaving `current_stage` on the failed stage.
    pub fn fail(&mut self, failure: JobFailure) -> Result<(), IllegalTransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(failure);
        self.lease = None;
        Ok(())
    }

    /// Resets a terminal job for a deliberate re-run under a new generation.
    pub fn reset_for_rerun(&mut self) -> Result<(), IllegalTransitionError> {
        if !self.is_terminal() {
            return Err(self.illegal(format!("only terminal jobs can be re-run, job is {}", self.status)));
        }
        self.generation += 1;
        self.status = JobStatus::Queued;
        self.stages_completed.clear();
        self.current_stage = None;
        self.output_refs.clear();
        self.error = None;
        self.attempts = 0;
        self.lease = None;
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), IllegalTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(self.illegal(format!("{} -> {next}", self.status)));
        }
        self.status = next;
        Ok(())
    }

    fn illegal(&self, message: impl Into<String>) -> IllegalTransitionError {
        IllegalTransitionError::new(self.key.to_string(), message)
    }
}
