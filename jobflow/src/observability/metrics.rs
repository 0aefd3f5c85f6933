//! Run metrics.
//!
//! The orchestrator and the dead-letter processor report through the
//! [`Metrics`] trait. [`PrometheusMetrics`] keeps them in its own registry
//! and renders the text exposition format on demand.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, Encoder,
    HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::time::Duration;

use crate::errors::{JobflowError, Result};

/// Stage and job durations cover minutes-long model calls.
const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0];

/// Sink for run metrics.
pub trait Metrics: Send + Sync {
    /// One stage execution settled with `outcome` after `duration`.
    fn stage_finished(&self, stage: &str, outcome: &str, duration: Duration);

    /// One run of a job ended with `outcome` after `duration`.
    fn run_finished(&self, outcome: &str, duration: Duration);

    /// The dead-letter processor handled a message of `kind`.
    fn dead_lettered(&self, kind: &str);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl Metrics for NoOpMetrics {
    fn stage_finished(&self, _stage: &str, _outcome: &str, _duration: Duration) {}

    fn run_finished(&self, _outcome: &str, _duration: Duration) {}

    fn dead_lettered(&self, _kind: &str) {}
}

/// Prometheus-backed metrics.
///
/// | Metric                               | Labels             |
/// |--------------------------------------|--------------------|
/// | `jobflow_stage_duration_seconds`     | `stage`, `outcome` |
/// | `jobflow_stages_total`               | `stage`, `outcome` |
/// | `jobflow_run_duration_seconds`       | `outcome`          |
/// | `jobflow_runs_total`                 | `outcome`          |
/// | `jobflow_dead_letters_total`         | `kind`             |
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    stage_duration: HistogramVec,
    stages: IntCounterVec,
    run_duration: HistogramVec,
    runs: IntCounterVec,
    dead_letters: IntCounterVec,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

fn registration_error(err: prometheus::Error) -> JobflowError {
    JobflowError::Config(format!("cannot register metric: {err}"))
}

impl PrometheusMetrics {
    /// Registers every metric in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let stage_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new("jobflow_stage_duration_seconds", "Stage execution time")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["stage", "outcome"],
            registry
        )
        .map_err(registration_error)?;
        let stages = register_int_counter_vec_with_registry!(
            Opts::new("jobflow_stages_total", "Stage executions by outcome"),
            &["stage", "outcome"],
            registry
        )
        .map_err(registration_error)?;
        let run_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new("jobflow_run_duration_seconds", "Job run time")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["outcome"],
            registry
        )
        .map_err(registration_error)?;
        let runs = register_int_counter_vec_with_registry!(
            Opts::new("jobflow_runs_total", "Job runs by outcome"),
            &["outcome"],
            registry
        )
        .map_err(registration_error)?;
        let dead_letters = register_int_counter_vec_with_registry!(
            Opts::new("jobflow_dead_letters_total", "Dead-lettered messages by kind"),
            &["kind"],
            registry
        )
        .map_err(registration_error)?;

        Ok(Self {
            registry,
            stage_duration,
            stages,
            run_duration,
            runs,
            dead_letters,
        })
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every metric in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| JobflowError::storage(format!("cannot encode metrics: {e}")))?;
        String::from_utf8(buffer).map_err(|e| JobflowError::storage(format!("metrics are not UTF-8: {e}")))
    }

    /// Writes [`encode`](Self::encode) output to `path` for a textfile
    /// collector. The file is replaced atomically.
    pub async fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.encode()?;
        let staging = path.with_extension("prom.tmp");
        tokio::fs::write(&staging, text).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

impl Metrics for PrometheusMetrics {
    fn stage_finished(&self, stage: &str, outcome: &str, duration: Duration) {
        self.stage_duration
            .with_label_values(&[stage, outcome])
            .observe(duration.as_secs_f64());
        self.stages.with_label_values(&[stage, outcome]).inc();
    }

    fn run_finished(&self, outcome: &str, duration: Duration) {
        self.run_duration
            .with_label_values(&[outcome])
            .observe(duration.as_secs_f64());
        self.runs.with_label_values(&[outcome]).inc();
    }

    fn dead_lettered(&self, kind: &str) {
        self.dead_letters.with_label_values(&[kind]).inc();
    }
}
