//! Per-attempt stage results.

use crate::core::{FailureKind, StageStatus};
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a single stage attempt.
///
/// Retried stages produce one result per attempt; the last one is the
/// stage's authoritative final status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Attempt outcome.
    pub status: StageStatus,
    /// Attempt number, starting at 1. Skipped stages use 0.
    pub attempt: u32,
    /// Process exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the attempt in milliseconds.
    pub duration_ms: u64,
    /// Captured stdout and stderr, possibly truncated.
    pub output: String,
    /// Distinguishes failures that bypass the retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Human-readable error, when the failure has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The timeout that was exceeded, for timed-out attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StageResult {
    fn base(name: impl Into<String>, status: StageStatus, attempt: u32) -> Self {
        Self {
            name: name.into(),
            status,
            attempt,
            exit_code: None,
            duration_ms: 0,
            output: String::new(),
            failure_kind: None,
            error: None,
            timeout_ms: None,
        }
    }

    /// Creates a successful result (exit code 0).
    #[must_use]
    pub fn success(name: impl Into<String>, attempt: u32, duration_ms: u64, output: String) -> Self {
        Self {
            exit_code: Some(0),
            duration_ms,
            output,
            ..Self::base(name, StageStatus::Success, attempt)
        }
    }

    /// Creates a failed result for a process that exited unsuccessfully.
    ///
    /// `exit_code` is `None` when the process was terminated by a signal.
    #[must_use]
    pub fn failure(
        name: impl Into<String>,
        attempt: u32,
        exit_code: Option<i32>,
        duration_ms: u64,
        output: String,
    ) -> Self {
        Self {
            exit_code,
            duration_ms,
            output,
            ..Self::base(name, StageStatus::Failure, attempt)
        }
    }

    /// Creates a result for a process that was killed after exceeding `timeout`.
    #[must_use]
    pub fn timeout(
        name: impl Into<String>,
        attempt: u32,
        timeout: Duration,
        duration_ms: u64,
        output: String,
    ) -> Self {
        Self {
            duration_ms,
            output,
            timeout_ms: Some(crate::utils::duration_ms(timeout)),
            error: Some(format!("timed out after {:.1}s", timeout.as_secs_f64())),
            ..Self::base(name, StageStatus::Timeout, attempt)
        }
    }

    /// Creates a result for a process that could not be started.
    #[must_use]
    pub fn launch_error(name: impl Into<String>, attempt: u32, reason: impl Into<String>) -> Self {
        Self {
            failure_kind: Some(FailureKind::LaunchError),
            error: Some(reason.into()),
            ..Self::base(name, StageStatus::Failure, attempt)
        }
    }

    /// Creates a result for a stage interrupted by pipeline cancellation.
    #[must_use]
    pub fn cancelled(
        name: impl Into<String>,
        attempt: u32,
        duration_ms: u64,
        output: String,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            duration_ms,
            output,
            failure_kind: Some(FailureKind::Cancelled),
            error: Some(reason.into()),
            ..Self::base(name, StageStatus::Failure, attempt)
        }
    }

    /// Creates a result for a stage whose hardware could not be acquired.
    #[must_use]
    pub fn hardware_unavailable(
        name: impl Into<String>,
        duration_ms: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            duration_ms,
            failure_kind: Some(FailureKind::HardwareUnavailable),
            error: Some(reason.into()),
            ..Self::base(name, StageStatus::Failure, 1)
        }
    }

    /// Creates a result for a stage that never ran.
    #[must_use]
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::base(name, StageStatus::Skipped, 0)
        }
    }

    /// Returns true if the attempt succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if this attempt was cut short by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.failure_kind == Some(FailureKind::Cancelled)
    }

    /// Classifies a non-successful attempt in the crate's error taxonomy.
    ///
    /// Returns `None` for successful and skipped results, and for
    /// cancellations and hardware failures which carry their own tags.
    #[must_use]
    pub fn to_error(&self) -> Option<PipelineError> {
        match (self.status, self.failure_kind) {
            (StageStatus::Failure, Some(FailureKind::LaunchError)) => {
                Some(PipelineError::ProcessLaunch {
                    stage: self.name.clone(),
                    reason: self.error.clone().unwrap_or_default(),
                })
            }
            (StageStatus::Failure, None) => Some(PipelineError::StageFailure {
                stage: self.name.clone(),
                exit_code: self.exit_code,
            }),
            (StageStatus::Timeout, _) => Some(PipelineError::StageTimeout {
                stage: self.name.clone(),
                timeout: Duration::from_millis(self.timeout_ms.unwrap_or(self.duration_ms)),
            }),
            _ => None,
        }
    }
}
