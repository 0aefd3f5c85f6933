//! Event sink trait and implementations.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, Level};

use crate::core::{ProcessingEvent, ProcessingEventType};
use crate::storage::schema::EVENTS_TABLE;
use crate::storage::{Storage, WriteCondition};

/// Receives audit events.
///
/// Emitting never fails from the caller's point of view: an audit record
/// that cannot be written is logged and dropped, and the job carries on.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: ProcessingEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: ProcessingEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: ProcessingEvent) {
        let stage = event.stage_name.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(
                job_id = %event.job_id,
                event_type = %event.event_type,
                stage,
                duration_ms = event.duration_ms,
                details = ?event.details,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                job_id = %event.job_id,
                event_type = %event.event_type,
                stage,
                duration_ms = event.duration_ms,
                details = ?event.details,
                "Event: {}", event.event_type
            );
        }
    }
}

/// Writes events to the `processing_events` table.
#[derive(Clone)]
pub struct StorageEventSink {
    storage: Arc<dyn Storage>,
    retention_days: Option<i64>,
}

impl std::fmt::Debug for StorageEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEventSink")
            .field("backend", &self.storage.backend_name())
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl StorageEventSink {
    /// Creates a sink writing through `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            retention_days: None,
        }
    }

    /// Overrides the retention window stamped on each event.
    #[must_use]
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = Some(days);
        self
    }
}

#[async_trait]
impl EventSink for StorageEventSink {
    async fn emit(&self, event: ProcessingEvent) {
        let event = match self.retention_days {
            Some(days) => event.with_retention_days(days),
            None => event,
        };
        let key = event.record_key();
        let record = match serde_json::to_value(&event) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(job_id = %event.job_id, error = %err, "Could not serialize audit event");
                return;
            }
        };
        if let Err(err) = self
            .storage
            .put_record(EVENTS_TABLE, &key, record, WriteCondition::Always)
            .await
        {
            tracing::warn!(job_id = %event.job_id, error = %err, "Dropping audit event");
        }
    }
}

/// Forwards every event to several sinks concurrently.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutEventSink {
    /// Creates a sink over `sinks`.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: ProcessingEvent) {
        join_all(self.sinks.iter().map(|sink| sink.emit(event.clone()))).await;
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<ProcessingEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProcessingEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of one kind.
    #[must_use]
    pub fn events_of_type(&self, event_type: ProcessingEventType) -> Vec<ProcessingEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Event kinds in emission order.
    #[must_use]
    pub fn types(&self) -> Vec<ProcessingEventType> {
        self.events.read().iter().map(|event| event.event_type).collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: ProcessingEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit(ProcessingEvent::job_created("job_1", "full_analysis")).await;
        LoggingEventSink::default()
            .emit(ProcessingEvent::stage_completed("job_1", "extract", 12.5))
            .await;
        LoggingEventSink::debug()
            .emit(ProcessingEvent::stage_failed("job_1", "extract", "boom"))
            .await;
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(ProcessingEvent::stage_started("job_1", "extract")).await;
        sink.emit(ProcessingEvent::stage_completed("job_1", "extract", 3.0)).await;
        sink.emit(ProcessingEvent::stage_started("job_1", "generate")).await;

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type(ProcessingEventType::StageStarted).len(), 2);
        assert_eq!(
            sink.types(),
            vec![
                ProcessingEventType::StageStarted,
                ProcessingEventType::StageCompleted,
                ProcessingEventType::StageStarted
            ]
        );

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_storage_sink_writes_records() {
        let storage = Arc::new(InMemoryStorage::new());
        let sink = StorageEventSink::new(storage.clone());
        sink.emit(ProcessingEvent::job_created("job_1", "full_analysis")).await;
        sink.emit(ProcessingEvent::job_completed("job_1", 100.0)).await;

        let records = storage.scan_records(EVENTS_TABLE).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|(key, _)| key.starts_with("job_1#")));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let first = Arc::new(CollectingEventSink::new());
        let second = Arc::new(CollectingEventSink::new());
        let fanout = FanoutEventSink::new(vec![first.clone()]).with_sink(second.clone());

        fanout.emit(ProcessingEvent::job_failed("job_1", "bad input")).await;
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
