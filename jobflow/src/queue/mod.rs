//! Job queue abstraction.
//!
//! Delivery is at-least-once. A received message stays hidden for the
//! visibility timeout; it is deleted by `ack`, made visible again by
//! `release`, and reappears on its own if the worker dies. A message
//! received more than `max_receives` times is moved to the dead-letter
//! queue instead of being delivered again.

pub mod dead_letter;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{JobKey, KEY_SEPARATOR};
use crate::errors::{Result, ValidationError};
use crate::utils::Timestamp;

pub use dead_letter::{DeadLetterAction, DeadLetterAnalysis, DeadLetterKind, DeadLetterProcessor};
pub use memory::InMemoryJobQueue;

/// Body of a queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Job identifier.
    pub job_id: String,
    /// `tenant#client` owner of the job.
    pub tenant_key: String,
    /// Delivery attempt this message represents, starting at 1.
    #[serde(default)]
    pub attempt_count: u32,
}

impl JobMessage {
    /// Builds the message announcing `key`.
    #[must_use]
    pub fn for_job(key: &JobKey) -> Self {
        Self {
            job_id: key.job_id.clone(),
            tenant_key: key.owner(),
            attempt_count: 0,
        }
    }

    /// Reassembles the composite job key.
    pub fn job_key(&self) -> std::result::Result<JobKey, ValidationError> {
        JobKey::parse(&format!("{}{KEY_SEPARATOR}{}", self.tenant_key, self.job_id))
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Handle for `ack`/`release`; only valid for this delivery.
    pub receipt: String,
    /// Message body, with `attempt_count` set to the receive count.
    pub message: JobMessage,
    /// How many times the message has been received, this one included.
    pub receive_count: u32,
    /// When the message was first enqueued.
    pub sent_at: Timestamp,
    /// When the message was first received.
    pub first_received_at: Timestamp,
}

/// Redelivery policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a received message stays hidden.
    pub visibility_timeout: Duration,
    /// Receives allowed before a message is dead-lettered.
    pub max_receives: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(900),
            max_receives: 3,
        }
    }
}

/// At-least-once message queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Appends a message.
    async fn enqueue(&self, message: JobMessage) -> Result<()>;

    /// Receives the next visible message, if any.
    async fn receive(&self) -> Result<Option<ReceivedMessage>>;

    /// Deletes a received message.
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Makes a received message visible again immediately.
    async fn release(&self, receipt: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trips_job_key() {
        let key = JobKey::new("acme", "c1", "job_20250101120000123_0a1b2c3d").unwrap();
        let message = JobMessage::for_job(&key);
        assert_eq!(message.tenant_key, "acme#c1");
        assert_eq!(message.job_key().unwrap(), key);
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::json!({"job_id": "job_20250101120000123", "tenant_key": "acme#c1"});
        let message: JobMessage = serde_json::from_value(json).unwrap();
        assert_eq!(message.attempt_count, 0);
        assert!(message.job_key().is_ok());
    }

    #[test]
    fn test_malformed_tenant_key() {
        let message = JobMessage {
            job_id: "job_20250101120000123".to_string(),
            tenant_key: "no-separator".to_string(),
            attempt_count: 1,
        };
        assert!(message.job_key().is_err());
    }
}
