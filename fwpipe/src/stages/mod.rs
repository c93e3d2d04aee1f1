//! Stage execution.
//!
//! A [`StageExecutor`] runs one attempt of one stage and always returns a
//! [`StageResult`]; a non-zero exit, a timeout or a launch failure are
//! ordinary outcomes, not errors. Retry decisions belong to the
//! orchestrator.

mod output;
mod process;
mod result;

pub use output::{OutputBuffer, TRUNCATION_MARKER};
pub use process::ProcessExecutor;
pub use result::StageResult;

use crate::cancellation::CancellationToken;
use crate::pipeline::{StageDefinition, DEFAULT_OUTPUT_LIMIT_BYTES};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-attempt inputs the orchestrator supplies to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Variables layered over the inherited process environment.
    pub env: BTreeMap<String, String>,
    /// Pipeline cancellation signal.
    pub cancel: Arc<CancellationToken>,
    /// Bound on captured output.
    pub output_limit_bytes: usize,
}

impl ExecutionContext {
    /// Creates a context for the given attempt.
    #[must_use]
    pub fn new(attempt: u32, cancel: Arc<CancellationToken>) -> Self {
        Self {
            attempt,
            env: BTreeMap::new(),
            cancel,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    /// Sets the environment.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the output limit.
    #[must_use]
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }
}

/// Trait for running a single stage attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs one attempt of `stage`.
    ///
    /// Implementations must honour `stage.timeout` and `ctx.cancel`, and
    /// must not return before any spawned process has been reaped.
    async fn execute(&self, stage: &StageDefinition, ctx: &ExecutionContext) -> StageResult;
}
