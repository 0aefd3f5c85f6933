//! In-memory job queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

use super::{JobMessage, JobQueue, QueueConfig, ReceivedMessage};
use crate::errors::Result;
use crate::utils::{generate_uuid, now_utc, Timestamp};

#[derive(Debug)]
struct Entry {
    message: JobMessage,
    receive_count: u32,
    sent_at: Timestamp,
    first_received_at: Option<Timestamp>,
    visible_at: Instant,
    receipt: Option<String>,
}

impl Entry {
    fn new(message: JobMessage) -> Self {
        Self {
            message,
            receive_count: 0,
            sent_at: now_utc(),
            first_received_at: None,
            visible_at: Instant::now(),
            receipt: None,
        }
    }
}

/// Process-local queue with visibility timeouts and a dead-letter target.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    config: QueueConfig,
    entries: Mutex<VecDeque<Entry>>,
    dead_letter: Option<Arc<InMemoryJobQueue>>,
}

impl InMemoryJobQueue {
    /// Creates a queue without a dead-letter target.
    #[must_use]
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            entries: Mutex::new(VecDeque::new()),
            dead_letter: None,
        }
    }

    /// Routes messages past `max_receives` to `dead_letter`.
    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter: Arc<InMemoryJobQueue>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Queue name for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages held, visible or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the queue holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Messages currently hidden by a receive.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.receipt.is_some() && entry.visible_at > now)
            .count()
    }

    fn push_entry(&self, entry: Entry) {
        self.entries.lock().push_back(entry);
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<()> {
        tracing::debug!(queue = %self.name, job_id = %message.job_id, "Message enqueued");
        self.push_entry(Entry::new(message));
        Ok(())
    }

    async fn receive(&self) -> Result<Option<ReceivedMessage>> {
        let now = Instant::now();
        let mut dead = Vec::new();
        let received = {
            let mut entries = self.entries.lock();
            let mut found = None;
            let mut idx = 0;
            while idx < entries.len() {
                if entries[idx].visible_at > now {
                    idx += 1;
                    continue;
                }
                if self.dead_letter.is_some() && entries[idx].receive_count >= self.config.max_receives {
                    if let Some(entry) = entries.remove(idx) {
                        dead.push(entry);
                    }
                    continue;
                }

                let entry = &mut entries[idx];
                let receipt = generate_uuid().to_string();
                entry.receive_count += 1;
                entry.visible_at = now + self.config.visibility_timeout;
                entry.receipt = Some(receipt.clone());
                // Dead-lettered messages keep the count from their source queue.
                entry.message.attempt_count = entry.message.attempt_count.max(entry.receive_count);
                let first_received_at = *entry.first_received_at.get_or_insert_with(now_utc);

                found = Some(ReceivedMessage {
                    receipt,
                    message: entry.message.clone(),
                    receive_count: entry.receive_count,
                    sent_at: entry.sent_at,
                    first_received_at,
                });
                break;
            }
            found
        };

        if let Some(target) = &self.dead_letter {
            for mut entry in dead {
                tracing::warn!(
                    queue = %self.name,
                    job_id = %entry.message.job_id,
                    receive_count = entry.receive_count,
                    "Message exceeded max receives, moving to dead-letter queue"
                );
                entry.receive_count = 0;
                entry.visible_at = now;
                entry.receipt = None;
                target.push_entry(entry);
            }
        }
        Ok(received)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(idx) = entries
            .iter()
            .position(|entry| entry.receipt.as_deref() == Some(receipt))
        {
            entries.remove(idx);
        } else {
            tracing::debug!(queue = %self.name, receipt, "Ack for unknown or stale receipt");
        }
        Ok(())
    }

    async fn release(&self, receipt: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.receipt.as_deref() == Some(receipt))
        {
            entry.visible_at = Instant::now();
            entry.receipt = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(id: &str) -> JobMessage {
        JobMessage {
            job_id: id.to_string(),
            tenant_key: "acme#c1".to_string(),
            attempt_count: 0,
        }
    }

    fn config(visibility_ms: u64, max_receives: u32) -> QueueConfig {
        QueueConfig {
            visibility_timeout: Duration::from_millis(visibility_ms),
            max_receives,
        }
    }

    #[tokio::test]
    async fn test_receive_hides_message() {
        let queue = InMemoryJobQueue::new("jobs", config(60_000, 3));
        queue.enqueue(message("job_a")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.message.job_id, "job_a");
        assert_eq!(first.message.attempt_count, 1);
        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.in_flight(), 1);

        queue.ack(&first.receipt).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_release_redelivers_immediately() {
        let queue = InMemoryJobQueue::new("jobs", config(60_000, 3));
        queue.enqueue(message("job_a")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.release(&first.receipt).await.unwrap();
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.receive_count, 2);
        assert_ne!(first.receipt, second.receipt);

        // The stale receipt no longer deletes the message.
        queue.ack(&first.receipt).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_expires() {
        let queue = InMemoryJobQueue::new("jobs", config(1_000, 3));
        queue.enqueue(message("job_a")).await.unwrap();
        let _first = queue.receive().await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(1_500)).await;
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.receive_count, 2);
    }

    #[tokio::test]
    async fn test_max_receives_moves_to_dead_letter() {
        let dlq = Arc::new(InMemoryJobQueue::new("jobs-dlq", config(60_000, 100)));
        let queue = InMemoryJobQueue::new("jobs", config(60_000, 2)).with_dead_letter(dlq.clone());
        queue.enqueue(message("job_a")).await.unwrap();

        for _ in 0..2 {
            let received = queue.receive().await.unwrap().unwrap();
            queue.release(&received.receipt).await.unwrap();
        }
        assert!(queue.receive().await.unwrap().is_none());
        assert!(queue.is_empty());

        let dead = dlq.receive().await.unwrap().unwrap();
        assert_eq!(dead.message.job_id, "job_a");
        assert_eq!(dead.message.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InMemoryJobQueue::new("jobs", QueueConfig::default());
        queue.enqueue(message("job_a")).await.unwrap();
        queue.enqueue(message("job_b")).await.unwrap();
        assert_eq!(queue.receive().await.unwrap().unwrap().message.job_id, "job_a");
        assert_eq!(queue.receive().await.unwrap().unwrap().message.job_id, "job_b");
    }
}
