//! Lifecycle event emission.
//!
//! The orchestrator reports progress through an [`EventSink`]. The binary
//! installs a [`LoggingEventSink`]; tests use [`CollectingEventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
