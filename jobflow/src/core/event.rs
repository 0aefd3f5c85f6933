//! Audit event type for job processing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::status::ProcessingEventType;

/// Days audit events are kept before expiring.
pub const DEFAULT_EVENT_RETENTION_DAYS: i64 = 7;

/// An append-only audit record.
///
/// Events are written for observability only; control logic never reads
/// them back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEvent {
    /// Unique event identifier.
    pub event_id: String,
    /// Job the event belongs to.
    pub job_id: String,
    /// When the event occurred (RFC 3339).
    pub timestamp: String,
    /// Event kind.
    pub event_type: ProcessingEventType,
    /// Stage the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    /// Elapsed time for completion events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Free-form details.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    /// Retention deadline.
    pub expires_at: String,
}

impl ProcessingEvent {
    /// Creates a new event for `job_id`.
    #[must_use]
    pub fn new(job_id: impl Into<String>, event_type: ProcessingEventType) -> Self {
        Self {
            event_id: crate::utils::generate_uuid().to_string(),
            job_id: job_id.into(),
            timestamp: crate::utils::iso_timestamp(),
            event_type,
            stage_name: None,
            duration_ms: None,
            details: HashMap::new(),
            expires_at: crate::utils::days_from_now(DEFAULT_EVENT_RETENTION_DAYS),
        }
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage_name = Some(stage.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Adds a detail field.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Overrides the retention window.
    #[must_use]
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.expires_at = crate::utils::days_from_now(days);
        self
    }

    /// Record key used by storage-backed sinks.
    #[must_use]
    pub fn record_key(&self) -> String {
        format!("{}#{}#{}", self.job_id, self.timestamp, self.event_id)
    }

    /// Creates a "job_created" event.
    #[must_use]
    pub fn job_created(job_id: &str, pipeline: &str) -> Self {
        Self::new(job_id, ProcessingEventType::JobCreated)
            .with_detail("pipeline", serde_json::json!(pipeline))
    }

    /// Creates a "stage_started" event.
    #[must_use]
    pub fn stage_started(job_id: &str, stage: &str) -> Self {
        Self::new(job_id, ProcessingEventType::StageStarted).with_stage(stage)
    }

    /// Creates a "stage_completed" event.
    #[must_use]
    pub fn stage_completed(job_id: &str, stage: &str, duration_ms: f64) -> Self {
        Self::new(job_id, ProcessingEventType::StageCompleted)
            .with_stage(stage)
            .with_duration(duration_ms)
    }

    /// Creates a "stage_failed" event.
    #[must_use]
    pub fn stage_failed(job_id: &str, stage: &str, error: &str) -> Self {
        Self::new(job_id, ProcessingEventType::StageFailed)
            .with_stage(stage)
            .with_detail("error", serde_json::json!(error))
    }

    /// Creates a "job_completed" event.
    #[must_use]
    pub fn job_completed(job_id: &str, duration_ms: f64) -> Self {
        Self::new(job_id, ProcessingEventType::JobCompleted).with_duration(duration_ms)
    }

    /// Creates a "job_failed" event.
    #[must_use]
    pub fn job_failed(job_id: &str, reason: &str) -> Self {
        Self::new(job_id, ProcessingEventType::JobFailed)
            .with_detail("reason", serde_json::json!(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_started() {
        let event = ProcessingEvent::stage_started("job_1", "extract");
        assert_eq!(event.event_type, ProcessingEventType::StageStarted);
        assert_eq!(event.stage_name.as_deref(), Some("extract"));
        assert!(event.duration_ms.is_none());
    }

    #[test]
    fn test_stage_completed_carries_duration() {
        let event = ProcessingEvent::stage_completed("job_1", "extract", 123.45);
        assert_eq!(event.duration_ms, Some(123.45));
    }

    #[test]
    fn test_job_failed_details() {
        let event = ProcessingEvent::job_failed("job_1", "boom");
        assert_eq!(event.details.get("reason"), Some(&serde_json::json!("boom")));
    }

    #[test]
    fn test_record_keys_are_unique() {
        let a = ProcessingEvent::job_created("job_1", "full_analysis");
        let b = ProcessingEvent::job_created("job_1", "full_analysis");
        assert_ne!(a.record_key(), b.record_key());
        assert!(a.record_key().starts_with("job_1#"));
    }

    #[test]
    fn test_event_serialization() {
        let event = ProcessingEvent::stage_failed("job_1", "generate", "timeout");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "stage_failed");
        assert_eq!(json["stage_name"], "generate");

        let back: ProcessingEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event_id, event.event_id);
    }
}
