//! Pipeline definition and execution.
//!
//! This module provides:
//! - Stage and pipeline definitions with validation
//! - The retry policy and backoff calculator
//! - Environment propagation between stages
//! - The sequential [`Orchestrator`] and the [`PipelineRun`] it produces

pub mod env;
mod orchestrator;
mod retry;
mod run;
mod spec;


pub use env::{EnvFile, StageEnvironment};
pub use orchestrator::Orchestrator;
pub use retry::{decide, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision};
pub use run::{
    PipelineRun, StageRecord, EXIT_CANCELLED, EXIT_CONFIG_ERROR, EXIT_HARDWARE_FAILURE,
    EXIT_STAGE_FAILURE, EXIT_SUCCESS,
};
pub use spec::{
    HardwareSettings, PipelineDefinition, StageDefinition, DEFAULT_ACQUIRE_TIMEOUT,
    DEFAULT_HARDWARE_RESOURCE, DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_STAGE_TIMEOUT,
};
