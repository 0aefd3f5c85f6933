//! Engine configuration.
//!
//! A [`JobflowConfig`] is built once at startup, from a JSON file, from
//! `JOBFLOW_*` environment variables, or both (the environment overrides
//! the file), and passed by reference to whatever needs it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{JobflowError, Result};
use crate::orchestrator::LeaseConfig;
use crate::pipeline::{PipelineCatalog, RetryConfig};
use crate::queue::QueueConfig;
use crate::storage::StorageConfig;

/// Environment variable naming a JSON config file.
pub const CONFIG_FILE_VAR: &str = "JOBFLOW_CONFIG";

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_visibility_timeout_secs() -> u64 {
    900
}

fn default_max_receives() -> u32 {
    3
}

fn default_job_time_budget_secs() -> u64 {
    720
}

fn default_stall_threshold_secs() -> u64 {
    1_800
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_jobs_days() -> i64 {
    30
}

fn default_checkpoints_days() -> i64 {
    crate::checkpoint::DEFAULT_CHECKPOINT_RETENTION_DAYS
}

fn default_events_days() -> i64 {
    crate::core::DEFAULT_EVENT_RETENTION_DAYS
}

fn default_stage_service_timeout_secs() -> u64 {
    600
}

fn default_metrics_interval_secs() -> u64 {
    15
}

fn default_log_filter() -> String {
    "jobflow=info".to_string()
}

/// Worker pool and queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent workers, each handling one message at a time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Sleep between empty receives.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a received message stays hidden.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Receives before a message is dead-lettered.
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,
    /// Wall time one pickup may spend before yielding; 0 disables the budget.
    #[serde(default = "default_job_time_budget_secs")]
    pub job_time_budget_secs: u64,
    /// Age after which a `processing` job is considered abandoned.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// Period of the stall sweep and dead-letter drain.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Lifetime of a run's claim on a job if it stops renewing it.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Renewal period of the claim while a stage runs.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receives: default_max_receives(),
            job_time_budget_secs: default_job_time_budget_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl WorkerConfig {
    /// Redelivery policy for the work queue.
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            max_receives: self.max_receives,
        }
    }

    /// Sleep between empty receives.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-pickup time budget, if any.
    #[must_use]
    pub fn job_time_budget(&self) -> Option<Duration> {
        (self.job_time_budget_secs > 0).then(|| Duration::from_secs(self.job_time_budget_secs))
    }

    /// Age after which a `processing` job is considered abandoned.
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    /// Period of the maintenance loop.
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Job lease settings for the orchestrator.
    #[must_use]
    pub fn lease(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_secs(self.lease_ttl_secs),
            heartbeat: Duration::from_secs(self.heartbeat_secs),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(JobflowError::Config("worker.workers must be at least 1".to_string()));
        }
        if self.max_receives == 0 {
            return Err(JobflowError::Config("worker.max_receives must be at least 1".to_string()));
        }
        if self.heartbeat_secs == 0 || self.heartbeat_secs >= self.lease_ttl_secs {
            return Err(JobflowError::Config(format!(
                "worker.heartbeat_secs ({}) must be positive and below worker.lease_ttl_secs ({})",
                self.heartbeat_secs, self.lease_ttl_secs
            )));
        }
        // A redelivery after the holder died must find the lease lapsed.
        if self.lease_ttl_secs > self.visibility_timeout_secs {
            return Err(JobflowError::Config(format!(
                "worker.lease_ttl_secs ({}) exceeds worker.visibility_timeout_secs ({})",
                self.lease_ttl_secs, self.visibility_timeout_secs
            )));
        }
        if self.stall_threshold_secs < self.lease_ttl_secs {
            return Err(JobflowError::Config(format!(
                "worker.stall_threshold_secs ({}) is shorter than worker.lease_ttl_secs ({})",
                self.stall_threshold_secs, self.lease_ttl_secs
            )));
        }
        Ok(())
    }
}

/// Retention windows, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Job records.
    #[serde(default = "default_jobs_days")]
    pub jobs_days: i64,
    /// Checkpoint records.
    #[serde(default = "default_checkpoints_days")]
    pub checkpoints_days: i64,
    /// Audit events.
    #[serde(default = "default_events_days")]
    pub events_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            jobs_days: default_jobs_days(),
            checkpoints_days: default_checkpoints_days(),
            events_days: default_events_days(),
        }
    }
}

/// Remote stage service the worker delegates stages to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageServiceConfig {
    /// Base URL; the worker refuses to start without one.
    #[serde(default)]
    pub url: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_stage_service_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StageServiceConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_stage_service_timeout_secs(),
        }
    }
}

impl StageServiceConfig {
    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Metrics export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus textfile the worker rewrites periodically; off when unset.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
    /// Seconds between rewrites.
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            textfile: None,
            interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl MetricsConfig {
    /// Seconds between textfile rewrites.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = JobflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(JobflowError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobflowConfig {
    /// Storage backend.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Default retry budget for stages.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Worker pool.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Retention windows.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Stage service.
    #[serde(default)]
    pub stage_service: StageServiceConfig,
    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Named pipelines.
    #[serde(default)]
    pub pipelines: PipelineCatalog,
}

impl JobflowConfig {
    /// Parses a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| JobflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            JobflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Loads from the process environment.
    ///
    /// Starts from the file named by `JOBFLOW_CONFIG` if set, defaults
    /// otherwise, then applies `JOBFLOW_*` overrides.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_VAR) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("JOBFLOW_STORAGE") {
            self.storage = match backend.as_str() {
                "memory" => StorageConfig::Memory,
                "filesystem" => StorageConfig::Filesystem {
                    root: lookup("JOBFLOW_STORAGE_ROOT")
                        .map(PathBuf::from)
                        .ok_or_else(|| missing("JOBFLOW_STORAGE_ROOT"))?,
                },
                "remote" => StorageConfig::Remote {
                    base_url: lookup("JOBFLOW_STORAGE_URL").ok_or_else(|| missing("JOBFLOW_STORAGE_URL"))?,
                    timeout_ms: parsed(lookup, "JOBFLOW_STORAGE_TIMEOUT_MS")?.unwrap_or(10_000),
                },
                other => {
                    return Err(JobflowError::Config(format!("unknown storage backend '{other}'")));
                }
            };
        }

        let worker = &mut self.worker;
        if let Some(v) = parsed(lookup, "JOBFLOW_WORKERS")? {
            worker.workers = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_POLL_INTERVAL_MS")? {
            worker.poll_interval_ms = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_VISIBILITY_TIMEOUT_SECS")? {
            worker.visibility_timeout_secs = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_MAX_RECEIVES")? {
            worker.max_receives = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_JOB_TIME_BUDGET_SECS")? {
            worker.job_time_budget_secs = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_STALL_THRESHOLD_SECS")? {
            worker.stall_threshold_secs = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_LEASE_TTL_SECS")? {
            worker.lease_ttl_secs = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_HEARTBEAT_SECS")? {
            worker.heartbeat_secs = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_RETENTION_DAYS")? {
            self.retention.jobs_days = v;
            self.retention.checkpoints_days = v;
        }
        if let Some(filter) = lookup("JOBFLOW_LOG") {
            self.logging.filter = filter;
        }
        if let Some(format) = lookup("JOBFLOW_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(url) = lookup("JOBFLOW_STAGE_SERVICE_URL") {
            self.stage_service.url = Some(url);
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_STAGE_SERVICE_TIMEOUT_SECS")? {
            self.stage_service.timeout_secs = v;
        }
        if let Some(path) = lookup("JOBFLOW_METRICS_FILE") {
            self.metrics.textfile = Some(PathBuf::from(path));
        }
        if let Some(v) = parsed(lookup, "JOBFLOW_METRICS_INTERVAL_SECS")? {
            self.metrics.interval_secs = v;
        }
        if let Some(name) = lookup("JOBFLOW_DEFAULT_PIPELINE") {
            self.pipelines.default_pipeline = name;
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        let retention = &self.retention;
        if retention.jobs_days <= 0 || retention.checkpoints_days <= 0 || retention.events_days <= 0 {
            return Err(JobflowError::Config("retention windows must be positive".to_string()));
        }
        if self.metrics.interval_secs == 0 {
            return Err(JobflowError::Config("metrics interval must be positive".to_string()));
        }
        self.pipelines
            .validate()
            .map_err(|e| JobflowError::Config(e.to_string()))
    }
}

fn missing(var: &str) -> JobflowError {
    JobflowError::Config(format!("{var} is required for this storage backend"))
}

fn parsed<F, T>(lookup: &F, var: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| JobflowError::Config(format!("{var}={raw}: {e}")))
        })
        .transpose()
}
