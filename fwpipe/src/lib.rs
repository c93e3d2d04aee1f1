//! # fwpipe
//!
//! Stage orchestration for embedded firmware CI.
//!
//! fwpipe runs an ordered list of external commands (build, unit test,
//! hardware-in-the-loop test) with support for:
//!
//! - **Bounded execution**: per-stage timeouts that kill the whole process group
//! - **Retry policy**: per-stage retry budgets with configurable backoff
//! - **Hardware locks**: exclusive, scoped access to shared test rigs
//! - **Environment propagation**: stages hand variables to later stages
//! - **Cancellation**: a token that stops the running stage and skips the rest
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fwpipe::prelude::*;
//!
//! let definition = PipelineDefinition::new("firmware-ci")
//!     .with_stage(StageDefinition::new("build", ["west", "build"]).with_kind(StageKind::Build))
//!     .with_stage(StageDefinition::shell("hil", "pytest hil/").with_kind(StageKind::Hil).with_retry(true, 1));
//!
//! let run = Orchestrator::default()
//!     .run(&definition, Arc::new(CancellationToken::new()))
//!     .await;
//! std::process::exit(run.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod hardware;
pub mod observability;
pub mod pipeline;
pub mod report;
pub mod stages;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::load_from_path;
    pub use crate::core::{
        FailureKind, PipelineEvent, PipelineState, PipelineStatus, StageKind, StageStatus,
    };
    pub use crate::errors::{ConfigError, HardwareAcquisitionError, PipelineError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::hardware::{HardwareLease, HardwareLock, InProcessLocks, LockFileLocks};
    pub use crate::pipeline::{
        Orchestrator, PipelineDefinition, PipelineRun, RetryConfig, StageDefinition, StageRecord,
    };
    pub use crate::stages::{ExecutionContext, ProcessExecutor, StageExecutor, StageResult};
    pub use std::sync::Arc;
}
