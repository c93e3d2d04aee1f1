//! The record of one pipeline execution.

use super::StageDefinition;
use crate::core::{FailureKind, PipelineState, PipelineStatus, StageKind, StageStatus};
use crate::stages::StageResult;
use crate::utils::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code when a stage failed or timed out.
pub const EXIT_STAGE_FAILURE: i32 = 1;
/// Process exit code when the configuration could not be loaded.
pub const EXIT_CONFIG_ERROR: i32 = 2;
/// Process exit code when hardware could not be acquired.
pub const EXIT_HARDWARE_FAILURE: i32 = 3;
/// Process exit code when the run was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Every attempt made for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Hardware resource the stage held, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    /// Attempts in execution order.
    pub attempts: Vec<StageResult>,
}

impl StageRecord {
    /// Creates an empty record for `definition`.
    #[must_use]
    pub fn new(definition: &StageDefinition, hardware: Option<&str>) -> Self {
        Self {
            name: definition.name.clone(),
            kind: definition.kind,
            hardware: hardware.map(str::to_string),
            attempts: Vec::new(),
        }
    }

    /// Appends an attempt.
    pub fn push(&mut self, result: StageResult) {
        self.attempts.push(result);
    }

    /// The last attempt, which carries the stage's final status.
    #[must_use]
    pub fn final_result(&self) -> Option<&StageResult> {
        self.attempts.last()
    }

    /// The stage's final status. A record with no attempts counts as skipped.
    #[must_use]
    pub fn final_status(&self) -> StageStatus {
        self.final_result().map_or(StageStatus::Skipped, |r| r.status)
    }

    /// Number of attempts that actually ran.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.iter().filter(|r| r.attempt > 0).count()
    }

    /// Total time spent across all attempts.
    #[must_use]
    pub fn total_duration_ms(&self) -> u64 {
        self.attempts.iter().map(|r| r.duration_ms).sum()
    }
}

/// One end-to-end execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Stage definitions in declared order.
    pub definitions: Vec<StageDefinition>,
    /// One record per definition, in the same order.
    pub records: Vec<StageRecord>,
    /// Lifecycle state.
    pub state: PipelineState,
    /// Aggregate status.
    pub status: PipelineStatus,
    /// When the first stage started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Why the run was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Whether cancellation stopped the run.
    #[serde(default)]
    pub cancelled: bool,
    /// SHA-256 of the configuration source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
}

impl PipelineRun {
    /// Creates a run that has not started yet.
    #[must_use]
    pub fn new(run_id: Uuid, pipeline: impl Into<String>, definitions: Vec<StageDefinition>) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            definitions,
            records: Vec::new(),
            state: PipelineState::NotStarted,
            status: PipelineStatus::Failure,
            started_at: None,
            ended_at: None,
            abort_reason: None,
            cancelled: false,
            source_digest: None,
        }
    }

    /// Sets the configuration digest.
    #[must_use]
    pub fn with_source_digest(mut self, digest: Option<String>) -> Self {
        self.source_digest = digest;
        self
    }

    /// Transitions to `Running`.
    pub fn start(&mut self) {
        self.state = PipelineState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transitions to a terminal state and rolls up the status.
    pub fn finish(&mut self, abort_reason: Option<String>) {
        self.state = if abort_reason.is_some() {
            PipelineState::Aborted
        } else {
            PipelineState::Completed
        };
        self.abort_reason = abort_reason;
        let statuses: Vec<StageStatus> =
            self.records.iter().map(StageRecord::final_status).collect();
        self.status = PipelineStatus::aggregate(&statuses);
        if self.records.len() < self.definitions.len() {
            self.status = PipelineStatus::Failure;
        }
        self.ended_at = Some(Utc::now());
    }

    /// Final result of every stage, in declared order.
    #[must_use]
    pub fn results(&self) -> Vec<&StageResult> {
        self.records.iter().filter_map(StageRecord::final_result).collect()
    }

    /// Looks up a stage record by name.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&StageRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Returns true if the run completed and every stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Completed && self.status == PipelineStatus::Success
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => u64::try_from((end - start).num_milliseconds()).unwrap_or(0),
            _ => 0,
        }
    }

    /// The process exit code this run maps to.
    ///
    /// Cancellation takes precedence over hardware failure, which takes
    /// precedence over ordinary stage failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            return EXIT_SUCCESS;
        }
        let kinds: Vec<FailureKind> = self
            .results()
            .into_iter()
            .filter_map(|r| r.failure_kind)
            .collect();
        if self.cancelled || kinds.contains(&FailureKind::Cancelled) {
            EXIT_CANCELLED
        } else if kinds.contains(&FailureKind::HardwareUnavailable) {
            EXIT_HARDWARE_FAILURE
        } else {
            EXIT_STAGE_FAILURE
        }
    }
}
