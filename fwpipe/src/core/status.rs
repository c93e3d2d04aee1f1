//! Stage and pipeline status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Compiles firmware artifacts.
    Build,
    /// Runs host-side unit tests.
    UnitTest,
    /// Runs hardware-in-the-loop tests against a physical rig.
    Hil,
    /// Any other command.
    Custom,
}

impl Default for StageKind {
    fn default() -> Self {
        Self::Custom
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::UnitTest => write!(f, "unit_test"),
            Self::Hil => write!(f, "hil"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl StageKind {
    /// Returns true if stages of this kind need an exclusive hardware resource.
    #[must_use]
    pub fn requires_hardware(&self) -> bool {
        matches!(self, Self::Hil)
    }
}

/// The outcome of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The command exited with code 0.
    Success,
    /// The command exited non-zero, could not be launched, or was cancelled.
    Failure,
    /// The command exceeded its timeout and was killed.
    Timeout,
    /// The stage never ran because an earlier stage aborted the pipeline.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the stage ran and did not succeed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }
}

/// Distinguishes failures that bypass the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The process could not be started at all.
    LaunchError,
    /// The pipeline was cancelled while the stage was running.
    Cancelled,
    /// The stage's hardware resource could not be acquired.
    HardwareUnavailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaunchError => write!(f, "launch_error"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::HardwareUnavailable => write!(f, "hardware_unavailable"),
        }
    }
}

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Created but not yet started.
    NotStarted,
    /// Stages are executing.
    Running,
    /// Every stage ran to completion.
    Completed,
    /// A fatal failure or cancellation stopped the run early.
    Aborted,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl PipelineState {
    /// Returns true if the run has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Aggregate status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every stage's final status is success.
    Success,
    /// At least one stage failed, timed out, or was skipped.
    Failure,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

impl PipelineStatus {
    /// Rolls up per-stage final statuses.
    ///
    /// An empty set of stages counts as success.
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a StageStatus>) -> Self {
        if statuses.into_iter().all(StageStatus::is_success) {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Build.to_string(), "build");
        assert_eq!(StageKind::UnitTest.to_string(), "unit_test");
        assert_eq!(StageKind::Hil.to_string(), "hil");
        assert_eq!(StageKind::Custom.to_string(), "custom");
    }

    #[test]
    fn test_stage_kind_requires_hardware() {
        assert!(StageKind::Hil.requires_hardware());
        assert!(!StageKind::Build.requires_hardware());
        assert!(!StageKind::UnitTest.requires_hardware());
    }

    #[test]
    fn test_stage_status_predicates() {
        assert!(StageStatus::Success.is_success());
        assert!(!StageStatus::Skipped.is_success());
        assert!(StageStatus::Timeout.is_failure());
        assert!(StageStatus::Failure.is_failure());
        assert!(!StageStatus::Skipped.is_failure());
    }

    #[test]
    fn test_pipeline_status_aggregate() {
        let all_ok = [StageStatus::Success, StageStatus::Success];
        assert_eq!(PipelineStatus::aggregate(&all_ok), PipelineStatus::Success);

        let skipped = [StageStatus::Success, StageStatus::Skipped];
        assert_eq!(PipelineStatus::aggregate(&skipped), PipelineStatus::Failure);

        let timeout = [StageStatus::Timeout];
        assert_eq!(PipelineStatus::aggregate(&timeout), PipelineStatus::Failure);
    }

    #[test]
    fn test_pipeline_state_terminal() {
        assert!(!PipelineState::NotStarted.is_terminal());
        assert!(!PipelineState::Running.is_terminal());
        assert!(PipelineState::Completed.is_terminal());
        assert!(PipelineState::Aborted.is_terminal());
    }

    #[test]
    fn test_stage_kind_serialize() {
        let json = serde_json::to_string(&StageKind::UnitTest).unwrap();
        assert_eq!(json, r#""unit_test""#);

        let kind: StageKind = serde_json::from_str(r#""hil""#).unwrap();
        assert_eq!(kind, StageKind::Hil);
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::LaunchError.to_string(), "launch_error");
        assert_eq!(FailureKind::HardwareUnavailable.to_string(), "hardware_unavailable");
    }
}
