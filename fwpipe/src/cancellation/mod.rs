//! Cancellation support for pipeline runs.
//!
//! A single [`CancellationToken`] is shared between the caller (for example
//! the CLI's Ctrl-C handler) and the orchestrator, which hands it to the
//! executor of the active stage.

mod token;

pub use token::{CancelCallback, CancellationToken};
