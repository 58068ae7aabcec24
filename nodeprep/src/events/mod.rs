//! Structured pipeline events.
//!
//! Sinks receive one event per engine decision; the default
//! [`LoggingEventSink`] forwards them to `tracing` at debug level.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
