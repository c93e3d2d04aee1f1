//! Core domain model types for fwpipe.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage kind and status enums
//! - Pipeline state and aggregate status
//! - Lifecycle events

mod event;
mod status;

pub use event::PipelineEvent;
pub use status::{FailureKind, PipelineState, PipelineStatus, StageKind, StageStatus};
