//! Error types for the fwpipe orchestrator.
//!
//! Only configuration and hardware acquisition problems abort a pipeline
//! outright. Ordinary stage failures (non-zero exit, timeout) are reported
//! through [`crate::stages::StageResult`] and flow through the retry policy;
//! the variants below exist so callers can classify them uniformly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for fwpipe operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline definition could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A required hardware resource could not be acquired.
    #[error("{0}")]
    HardwareAcquisition(#[from] HardwareAcquisitionError),

    /// A stage command could not be launched.
    #[error("Failed to launch stage '{stage}': {reason}")]
    ProcessLaunch {
        /// The stage name.
        stage: String,
        /// Why the launch failed.
        reason: String,
    },

    /// A stage command exited unsuccessfully.
    #[error("Stage '{stage}' failed with exit code {exit_code:?}")]
    StageFailure {
        /// The stage name.
        stage: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// A stage command exceeded its timeout.
    #[error("Stage '{stage}' timed out after {}s", timeout.as_secs_f64())]
    StageTimeout {
        /// The stage name.
        stage: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Returns true if the retry policy may re-run the stage after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StageFailure { .. } | Self::StageTimeout { .. })
    }

    /// Returns true if this error aborts the pipeline regardless of policy.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::HardwareAcquisition(_) | Self::ProcessLaunch { .. }
        )
    }
}

/// Error raised when a pipeline definition cannot be used.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The configuration file involved, if any.
    pub path: Option<PathBuf>,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            stages: Vec::new(),
        }
    }

    /// Sets the configuration path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Adds a single stage to the error.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stages.push(stage.into());
        self
    }
}

/// Error raised when an exclusive hardware resource cannot be acquired.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HardwareAcquisitionError {
    /// The resource stayed busy for the whole acquisition window.
    #[error("Hardware resource '{resource}' not acquired within {timeout_secs}s")]
    Timeout {
        /// The resource name.
        resource: String,
        /// The acquisition window in seconds.
        timeout_secs: u64,
    },

    /// The lock backend failed.
    #[error("Hardware lock backend error for '{resource}': {reason}")]
    Backend {
        /// The resource name.
        resource: String,
        /// Backend-specific failure description.
        reason: String,
    },

    /// Acquisition was abandoned because the pipeline was cancelled.
    #[error("Hardware acquisition for '{resource}' cancelled")]
    Cancelled {
        /// The resource name.
        resource: String,
    },
}

impl HardwareAcquisitionError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(resource: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            resource: resource.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Creates a backend error.
    #[must_use]
    pub fn backend(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Timeout { resource, .. }
            | Self::Backend { resource, .. }
            | Self::Cancelled { resource } => resource,
        }
    }
}
