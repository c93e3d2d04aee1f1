//! Pipeline lifecycle events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event emitted by the orchestrator while a run progresses.
///
/// Events are consumed by [`crate::events::EventSink`] implementations for
/// logging, monitoring, or tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event type (e.g., "stage.started", "hardware.acquired").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl PipelineEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the payload as a JSON object.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone().into_iter().collect())
    }

    /// Creates a "pipeline.started" event.
    #[must_use]
    pub fn pipeline_started(pipeline: &str, run_id: &str, stage_count: usize) -> Self {
        Self::new("pipeline.started")
            .add_data("pipeline", serde_json::json!(pipeline))
            .add_data("run_id", serde_json::json!(run_id))
            .add_data("stage_count", serde_json::json!(stage_count))
    }

    /// Creates a "pipeline.completed" event.
    #[must_use]
    pub fn pipeline_completed(pipeline: &str, run_id: &str, duration_ms: u64) -> Self {
        Self::new("pipeline.completed")
            .add_data("pipeline", serde_json::json!(pipeline))
            .add_data("run_id", serde_json::json!(run_id))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "pipeline.aborted" event.
    #[must_use]
    pub fn pipeline_aborted(pipeline: &str, run_id: &str, reason: &str) -> Self {
        Self::new("pipeline.aborted")
            .add_data("pipeline", serde_json::json!(pipeline))
            .add_data("run_id", serde_json::json!(run_id))
            .add_data("reason", serde_json::json!(reason))
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn stage_started(stage: &str, attempt: u32) -> Self {
        Self::new("stage.started")
            .add_data("stage", serde_json::json!(stage))
            .add_data("attempt", serde_json::json!(attempt))
    }

    /// Creates a "stage.attempt_failed" event.
    #[must_use]
    pub fn attempt_failed(stage: &str, attempt: u32, status: &str, exit_code: Option<i32>) -> Self {
        Self::new("stage.attempt_failed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("attempt", serde_json::json!(attempt))
            .add_data("status", serde_json::json!(status))
            .add_data("exit_code", serde_json::json!(exit_code))
    }

    /// Creates a "stage.retrying" event.
    #[must_use]
    pub fn retrying(stage: &str, next_attempt: u32, delay_ms: u64) -> Self {
        Self::new("stage.retrying")
            .add_data("stage", serde_json::json!(stage))
            .add_data("attempt", serde_json::json!(next_attempt))
            .add_data("delay_ms", serde_json::json!(delay_ms))
    }

    /// Creates a "stage.completed" event carrying the final status.
    #[must_use]
    pub fn stage_completed(stage: &str, status: &str, attempts: usize, duration_ms: u64) -> Self {
        Self::new("stage.completed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("status", serde_json::json!(status))
            .add_data("attempts", serde_json::json!(attempts))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.skipped" event.
    #[must_use]
    pub fn stage_skipped(stage: &str, reason: &str) -> Self {
        Self::new("stage.skipped")
            .add_data("stage", serde_json::json!(stage))
            .add_data("reason", serde_json::json!(reason))
    }

    /// Creates a "hardware.acquired" event.
    #[must_use]
    pub fn hardware_acquired(resource: &str, stage: &str, waited_ms: u64) -> Self {
        Self::new("hardware.acquired")
            .add_data("resource", serde_json::json!(resource))
            .add_data("stage", serde_json::json!(stage))
            .add_data("waited_ms", serde_json::json!(waited_ms))
    }

    /// Creates a "hardware.released" event.
    #[must_use]
    pub fn hardware_released(resource: &str, stage: &str, held_ms: u64) -> Self {
        Self::new("hardware.released")
            .add_data("resource", serde_json::json!(resource))
            .add_data("stage", serde_json::json!(stage))
            .add_data("held_ms", serde_json::json!(held_ms))
    }
}
