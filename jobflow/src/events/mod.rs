//! Audit event sinks.
//!
//! The orchestrator reports job and stage lifecycle events through an
//! [`EventSink`]. Events are observability only: nothing in the engine reads
//! them back.

mod sink;

pub use sink::{
    CollectingEventSink, EventSink, FanoutEventSink, LoggingEventSink, NoOpEventSink,
    StorageEventSink,
};
