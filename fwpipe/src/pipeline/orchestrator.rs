//! Sequential stage orchestration.

use super::env::{
    EnvFile, StageEnvironment, ATTEMPT_VAR, ENV_FILE_VAR, HARDWARE_VAR, RUN_ID_VAR, STAGE_VAR,
};
use super::retry::{decide, RetryDecision};
use super::run::{PipelineRun, StageRecord};
use super::{PipelineDefinition, StageDefinition};
use crate::cancellation::CancellationToken;
use crate::core::{FailureKind, PipelineEvent, StageStatus};
use crate::errors::HardwareAcquisitionError;
use crate::events::{EventSink, NoOpEventSink};
use crate::hardware::{HardwareLease, HardwareLock, InProcessLocks};
use crate::stages::{ExecutionContext, ProcessExecutor, StageExecutor, StageResult};
use crate::utils::{duration_ms, generate_run_id};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Runs pipeline definitions stage by stage.
///
/// All parts are shared behind `Arc`, so one orchestrator can serve
/// concurrent runs that contend for the same hardware.
#[derive(Clone)]
pub struct Orchestrator {
    executor: Arc<dyn StageExecutor>,
    hardware: Arc<dyn HardwareLock>,
    events: Arc<dyn EventSink>,
    env_dir: PathBuf,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(Arc::new(ProcessExecutor::new()), Arc::new(InProcessLocks::new()))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("hardware", &self.hardware)
            .field("env_dir", &self.env_dir)
            .finish_non_exhaustive()
    }
}

/// Per-run state threaded through stage execution.
struct RunScope<'a> {
    definition: &'a PipelineDefinition,
    run_id: Uuid,
    cancel: &'a Arc<CancellationToken>,
    env_file: Option<&'a EnvFile>,
    propagated: &'a BTreeMap<String, String>,
}

impl Orchestrator {
    /// Creates an orchestrator with the given executor and hardware backend.
    #[must_use]
    pub fn new(executor: Arc<dyn StageExecutor>, hardware: Arc<dyn HardwareLock>) -> Self {
        Self {
            executor,
            hardware,
            events: Arc::new(NoOpEventSink),
            env_dir: std::env::temp_dir(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets where per-run env files are created.
    #[must_use]
    pub fn with_env_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.env_dir = dir.into();
        self
    }

    /// Runs every stage of `definition` in order.
    ///
    /// Never fails: stage failures, timeouts, hardware problems and
    /// cancellation all end in a terminal [`PipelineRun`].
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        cancel: Arc<CancellationToken>,
    ) -> PipelineRun {
        let run_id = generate_run_id();
        let mut run = PipelineRun::new(run_id, &definition.name, definition.stages.clone())
            .with_source_digest(definition.source_digest.clone());
        run.start();

        info!(
            pipeline = %definition.name,
            run_id = %run_id,
            stages = definition.stages.len(),
            "Pipeline started"
        );
        self.emit(PipelineEvent::pipeline_started(
            &definition.name,
            &run_id.to_string(),
            definition.stages.len(),
        ))
        .await;

        let env_file = match EnvFile::create(&self.env_dir, run_id) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(dir = %self.env_dir.display(), error = %e, "Env file unavailable, variables will not propagate");
                None
            }
        };
        let mut propagated = BTreeMap::new();
        let mut abort_reason: Option<String> = None;

        for stage in &definition.stages {
            if abort_reason.is_none() && cancel.is_cancelled() {
                run.cancelled = true;
                abort_reason = Some(cancel_reason(&cancel));
            }
            if let Some(reason) = &abort_reason {
                run.records.push(self.skip(stage, reason).await);
                continue;
            }

            let scope = RunScope {
                definition,
                run_id,
                cancel: &cancel,
                env_file: env_file.as_ref(),
                propagated: &propagated,
            };
            let record = self.run_stage(&scope, stage).await;

            if cancel.is_cancelled() && record.final_status() != StageStatus::Success {
                run.cancelled = true;
                abort_reason = Some(cancel_reason(&cancel));
            } else if let Some(result) = record.final_result().filter(|r| !r.is_success()) {
                abort_reason = Some(describe_failure(result));
            } else if let Some(file) = &env_file {
                propagated.extend(file.read());
            }
            run.records.push(record);
        }

        run.finish(abort_reason.clone());
        let run_id = run_id.to_string();
        match abort_reason {
            Some(reason) => {
                warn!(pipeline = %definition.name, run_id = %run_id, reason = %reason, "Pipeline aborted");
                self.emit(PipelineEvent::pipeline_aborted(&definition.name, &run_id, &reason))
                    .await;
            }
            None => {
                info!(
                    pipeline = %definition.name,
                    run_id = %run_id,
                    status = %run.status,
                    duration_ms = run.duration_ms(),
                    "Pipeline completed"
                );
                self.emit(PipelineEvent::pipeline_completed(
                    &definition.name,
                    &run_id,
                    run.duration_ms(),
                ))
                .await;
            }
        }
        run
    }

    async fn run_stage(&self, scope: &RunScope<'_>, stage: &StageDefinition) -> StageRecord {
        let settings = &scope.definition.hardware;
        let resource = stage.hardware_resource(&settings.default_resource);
        let mut record = StageRecord::new(stage, resource);

        let lease = match resource {
            Some(resource) => match self.acquire(scope, stage, resource).await {
                Ok(lease) => Some(lease),
                Err(result) => {
                    record.push(result);
                    self.emit_completed(&record).await;
                    return record;
                }
            },
            None => None,
        };

        let mut attempt = 1;
        loop {
            let ctx = ExecutionContext::new(attempt, Arc::clone(scope.cancel))
                .with_env(stage_env(scope, stage, attempt, lease.as_ref()))
                .with_output_limit(scope.definition.output_limit_bytes);

            // Only what the final, successful attempt writes is propagated.
            if let Some(file) = scope.env_file {
                file.reset();
            }

            info!(stage = %stage.name, attempt, "Stage started");
            self.emit(PipelineEvent::stage_started(&stage.name, attempt)).await;

            let result = self.executor.execute(stage, &ctx).await;
            let decision = decide(stage, &result, attempt, &scope.definition.retry);
            if !result.is_success() {
                warn!(
                    stage = %stage.name,
                    attempt,
                    status = %result.status,
                    exit_code = ?result.exit_code,
                    error = result.error.as_deref().unwrap_or(""),
                    "Stage attempt failed"
                );
                self.emit(PipelineEvent::attempt_failed(
                    &stage.name,
                    attempt,
                    &result.status.to_string(),
                    result.exit_code,
                ))
                .await;
            }
            record.push(result);

            let RetryDecision::Retry(delay) = decision else {
                break;
            };
            attempt += 1;
            info!(stage = %stage.name, attempt, delay_ms = duration_ms(delay), "Retrying stage");
            self.emit(PipelineEvent::retrying(&stage.name, attempt, duration_ms(delay)))
                .await;

            let cancelled = tokio::select! {
                () = tokio::time::sleep(delay) => false,
                () = scope.cancel.cancelled() => true,
            };
            if cancelled {
                let reason = cancel_reason(scope.cancel);
                info!(stage = %stage.name, attempt, reason = %reason, "Stage cancelled during backoff");
                record.push(StageResult::cancelled(&stage.name, attempt, 0, String::new(), reason));
                break;
            }
        }

        if let Some(lease) = lease {
            let resource = lease.resource().to_string();
            let held = lease.release();
            self.emit(PipelineEvent::hardware_released(
                &resource,
                &stage.name,
                duration_ms(held),
            ))
            .await;
        }
        self.emit_completed(&record).await;
        record
    }

    /// Acquires hardware for `stage`, or returns the result to record instead.
    async fn acquire(
        &self,
        scope: &RunScope<'_>,
        stage: &StageDefinition,
        resource: &str,
    ) -> Result<HardwareLease, StageResult> {
        let timeout = scope.definition.hardware.acquire_timeout;
        let started = Instant::now();
        info!(stage = %stage.name, resource, timeout_secs = timeout.as_secs_f64(), "Acquiring hardware");

        match self.hardware.acquire(resource, timeout, scope.cancel).await {
            Ok(lease) => {
                let waited = duration_ms(started.elapsed());
                info!(stage = %stage.name, resource, waited_ms = waited, "Hardware acquired");
                self.emit(PipelineEvent::hardware_acquired(resource, &stage.name, waited))
                    .await;
                Ok(lease)
            }
            Err(HardwareAcquisitionError::Cancelled { .. }) => Err(StageResult::skipped(
                &stage.name,
                cancel_reason(scope.cancel),
            )),
            Err(e) => {
                warn!(stage = %stage.name, resource, error = %e, "Hardware unavailable");
                Err(StageResult::hardware_unavailable(
                    &stage.name,
                    duration_ms(started.elapsed()),
                    e.to_string(),
                ))
            }
        }
    }

    async fn skip(&self, stage: &StageDefinition, reason: &str) -> StageRecord {
        info!(stage = %stage.name, reason, "Stage skipped");
        self.emit(PipelineEvent::stage_skipped(&stage.name, reason)).await;
        let mut record = StageRecord::new(stage, None);
        record.push(StageResult::skipped(&stage.name, reason));
        record
    }

    async fn emit_completed(&self, record: &StageRecord) {
        let status = record.final_status();
        info!(
            stage = %record.name,
            status = %status,
            attempts = record.attempt_count(),
            "Stage finished"
        );
        self.emit(PipelineEvent::stage_completed(
            &record.name,
            &status.to_string(),
            record.attempt_count(),
            record.total_duration_ms(),
        ))
        .await;
    }

    async fn emit(&self, event: PipelineEvent) {
        self.events.emit(&event).await;
    }
}

fn stage_env(
    scope: &RunScope<'_>,
    stage: &StageDefinition,
    attempt: u32,
    lease: Option<&HardwareLease>,
) -> BTreeMap<String, String> {
    let mut env = StageEnvironment::new(&scope.definition.env)
        .overlay(scope.propagated)
        .overlay(&stage.env)
        .set(RUN_ID_VAR, scope.run_id.to_string())
        .set(STAGE_VAR, stage.name.as_str())
        .set(ATTEMPT_VAR, attempt.to_string());
    if let Some(file) = scope.env_file {
        env = env.set(ENV_FILE_VAR, file.path().display().to_string());
    }
    if let Some(lease) = lease {
        env = env.set(HARDWARE_VAR, lease.resource());
    }
    env.into_vars()
}

fn cancel_reason(cancel: &CancellationToken) -> String {
    match cancel.reason() {
        Some(reason) => format!("cancelled: {reason}"),
        None => "cancelled".to_string(),
    }
}

fn describe_failure(result: &StageResult) -> String {
    let detail = result.error.as_deref().unwrap_or("unknown error");
    match (result.status, result.failure_kind) {
        (StageStatus::Timeout, _) => format!("stage '{}' timed out", result.name),
        (_, Some(FailureKind::LaunchError)) => {
            format!("stage '{}' could not be launched: {detail}", result.name)
        }
        (_, Some(FailureKind::HardwareUnavailable)) => {
            format!("hardware unavailable for stage '{}': {detail}", result.name)
        }
        (_, Some(FailureKind::Cancelled)) => format!("stage '{}' cancelled", result.name),
        (StageStatus::Skipped, None) => format!("stage '{}' skipped: {detail}", result.name),
        (_, None) => match result.exit_code {
            Some(code) => format!("stage '{}' failed with exit code {code}", result.name),
            None => format!("stage '{}' terminated by signal", result.name),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineState, PipelineStatus, StageKind};
    use crate::events::CollectingEventSink;
    use crate::pipeline::{HardwareSettings, RetryConfig};
    use crate::stages::MockStageExecutor;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Orchestrator,
        locks: InProcessLocks,
        events: Arc<CollectingEventSink>,
        _dir: TempDir,
    }

    fn harness(executor: MockStageExecutor) -> Harness {
        let dir = TempDir::new().unwrap();
        let locks = InProcessLocks::new();
        let events = Arc::new(CollectingEventSink::new());
        let orchestrator = Orchestrator::new(Arc::new(executor), Arc::new(locks.clone()))
            .with_event_sink(events.clone())
            .with_env_dir(dir.path());
        Harness {
            orchestrator,
            locks,
            events,
            _dir: dir,
        }
    }

    fn firmware_pipeline(hil_retries: u32) -> PipelineDefinition {
        PipelineDefinition::new("firmware-ci")
            .with_retry_config(RetryConfig::immediate())
            .with_hardware(HardwareSettings {
                acquire_timeout: Duration::from_millis(100),
                ..HardwareSettings::default()
            })
            .with_stage(StageDefinition::new("build", ["make"]).with_kind(StageKind::Build))
            .with_stage(StageDefinition::new("unit-test", ["make", "test"]).with_kind(StageKind::UnitTest))
            .with_stage(
                StageDefinition::new("hil-test", ["run-hil"])
                    .with_kind(StageKind::Hil)
                    .with_retry(hil_retries > 0, hil_retries),
            )
    }

    fn ok(stage: &StageDefinition, ctx: &ExecutionContext) -> StageResult {
        StageResult::success(&stage.name, ctx.attempt, 1, String::new())
    }

    fn failed(stage: &StageDefinition, ctx: &ExecutionContext) -> StageResult {
        StageResult::failure(&stage.name, ctx.attempt, Some(1), 1, String::new())
    }

    fn statuses(run: &PipelineRun) -> Vec<StageStatus> {
        run.records.iter().map(StageRecord::final_status).collect()
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().times(3).returning(ok);
        let h = harness(executor);

        let run = h
            .orchestrator
            .run(&firmware_pipeline(0), Arc::new(CancellationToken::new()))
            .await;

        assert_eq!(run.state, PipelineState::Completed);
        assert_eq!(run.status, PipelineStatus::Success);
        assert_eq!(run.exit_code(), 0);
        assert_eq!(
            statuses(&run),
            vec![StageStatus::Success, StageStatus::Success, StageStatus::Success]
        );
        assert_eq!(run.record("hil-test").unwrap().hardware.as_deref(), Some("hil"));
        assert!(!h.locks.is_held("hil"));
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().returning(ok);
        let h = harness(executor);
        let definition = PipelineDefinition::new("ci")
            .with_stage(StageDefinition::new("hil", ["x"]).with_kind(StageKind::Hil));

        h.orchestrator
            .run(&definition, Arc::new(CancellationToken::new()))
            .await;

        assert_eq!(
            h.events.event_types(),
            vec![
                "pipeline.started",
                "hardware.acquired",
                "stage.started",
                "hardware.released",
                "stage.completed",
                "pipeline.completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().returning(|stage, ctx| {
            if stage.name == "hil-test" && ctx.attempt == 1 {
                failed(stage, ctx)
            } else {
                ok(stage, ctx)
            }
        });
        let h = harness(executor);

        let run = h
            .orchestrator
            .run(&firmware_pipeline(1), Arc::new(CancellationToken::new()))
            .await;

        assert_eq!(run.status, PipelineStatus::Success);
        let hil = run.record("hil-test").unwrap();
        assert_eq!(hil.attempt_count(), 2);
        assert_eq!(hil.attempts[0].status, StageStatus::Failure);
        assert_eq!(hil.attempts[1].status, StageStatus::Success);
        assert_eq!(run.record("build").unwrap().attempt_count(), 1);
        assert_eq!(h.events.events_of_type("stage.retrying").len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_aborts() {
        let mut executor = MockStageExecutor::new();
        executor
            .expect_execute()
            .times(2)
            .returning(|stage, ctx| if stage.name == "unit-test" { failed(stage, ctx) } else { ok(stage, ctx) });
        let h = harness(executor);

        let run = h
            .orchestrator
            .run(&firmware_pipeline(0), Arc::new(CancellationToken::new()))
            .await;

        assert_eq!(run.state, PipelineState::Aborted);
        assert_eq!(run.status, PipelineStatus::Failure);
        assert_eq!(
            statuses(&run),
            vec![StageStatus::Success, StageStatus::Failure, StageStatus::Skipped]
        );
        assert_eq!(run.exit_code(), 1);
        assert_eq!(
            run.abort_reason.as_deref(),
            Some("stage 'unit-test' failed with exit code 1")
        );
        assert_eq!(h.events.events_of_type("stage.skipped").len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().returning(|stage, ctx| {
            if stage.name == "hil-test" {
                StageResult::timeout(&stage.name, ctx.attempt, Duration::from_secs(1), 1000, String::new())
            } else {
                ok(stage, ctx)
            }
        });
        let h = harness(executor);

        let run = h
            .orchestrator
            .run(&firmware_pipeline(2), Arc::new(CancellationToken::new()))
            .await;

        let hil = run.record("hil-test").unwrap();
        assert_eq!(hil.attempt_count(), 3);
        assert_eq!(hil.final_status(), StageStatus::Timeout);
        assert_eq!(run.status, PipelineStatus::Failure);
        assert_eq!(run.abort_reason.as_deref(), Some("stage 'hil-test' timed out"));
    }

    #[tokio::test]
    async fn test_launch_error_not_retried() {
        let mut executor = MockStageExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .returning(|stage, ctx| StageResult::launch_error(&stage.name, ctx.attempt, "No such file"));
        let h = harness(executor);
        let definition = PipelineDefinition::new("ci")
            .with_retry_config(RetryConfig::immediate())
            .with_stage(StageDefinition::new("flaky", ["missing"]).with_retry(true, 5));

        let run = h
            .orchestrator
            .run(&definition, Arc::new(CancellationToken::new()))
            .await;

        assert_eq!(run.record("flaky").unwrap().attempt_count(), 1);
        assert_eq!(run.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_hardware_unavailable_aborts() {
        let mut executor = MockStageExecutor::new();
        executor
            .expect_execute()
            .times(2)
            .returning(ok);
        let h = harness(executor);
        let _held = h
            .locks
            .acquire("hil", Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();

        let run = h
            .orchestrator
            .run(&firmware_pipeline(3), Arc::new(CancellationToken::new()))
            .await;

        let hil = run.record("hil-test").unwrap();
        assert_eq!(hil.attempt_count(), 1);
        let result = hil.final_result().unwrap();
        assert_eq!(result.failure_kind, Some(FailureKind::HardwareUnavailable));
        assert_eq!(run.state, PipelineState::Aborted);
        assert_eq!(run.exit_code(), 3);
        assert!(h.events.events_of_type("hardware.acquired").is_empty());
    }

    #[tokio::test]
    async fn test_hardware_released_after_failure() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().returning(failed);
        let h = harness(executor);
        let definition = PipelineDefinition::new("ci")
            .with_stage(StageDefinition::new("hil", ["x"]).with_hardware("rig-2"));

        let run = h
            .orchestrator
            .run(&definition, Arc::new(CancellationToken::new()))
            .await;

        assert_eq!(run.status, PipelineStatus::Failure);
        assert!(!h.locks.is_held("rig-2"));
        assert_eq!(h.events.events_of_type("hardware.released").len(), 1);
    }

    #[tokio::test]
    async fn test_stage_environment() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().returning(|stage, ctx| {
            assert_eq!(ctx.env.get(STAGE_VAR), Some(&stage.name));
            assert_eq!(ctx.env.get(ATTEMPT_VAR).map(String::as_str), Some("1"));
            assert!(ctx.env.contains_key(RUN_ID_VAR));
            assert!(ctx.env.contains_key(ENV_FILE_VAR));
            assert_eq!(ctx.env.get("BOARD").map(String::as_str), Some("nrf52840dk"));
            assert_eq!(ctx.env.get("SHARED").map(String::as_str), Some("pipeline"));
            assert_eq!(ctx.env.get(HARDWARE_VAR).map(String::as_str), Some("hil"));
            assert_eq!(ctx.output_limit_bytes, 1024);
            ok(stage, ctx)
        });
        let h = harness(executor);
        let definition = PipelineDefinition::new("ci")
            .with_env("BOARD", "qemu")
            .with_env("SHARED", "pipeline")
            .with_output_limit(1024)
            .with_stage(
                StageDefinition::new("hil", ["x"])
                    .with_kind(StageKind::Hil)
                    .with_env("BOARD", "nrf52840dk"),
            );

        let run = h
            .orchestrator
            .run(&definition, Arc::new(CancellationToken::new()))
            .await;
        assert!(run.is_success());
    }

    #[tokio::test]
    async fn test_env_file_propagates_between_stages() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().returning(|stage, ctx| {
            if stage.name == "setup" {
                let path = ctx.env.get(ENV_FILE_VAR).unwrap();
                std::fs::write(path, "ZEPHYR_SDK_INSTALL_DIR=/opt/zephyr-sdk\n").unwrap();
            } else {
                assert_eq!(
                    ctx.env.get("ZEPHYR_SDK_INSTALL_DIR").map(String::as_str),
                    Some("/opt/zephyr-sdk")
                );
            }
            ok(stage, ctx)
        });
        let h = harness(executor);
        let definition = PipelineDefinition::new("ci")
            .with_stage(StageDefinition::new("setup", ["x"]))
            .with_stage(StageDefinition::new("build", ["y"]));

        let run = h
            .orchestrator
            .run(&definition, Arc::new(CancellationToken::new()))
            .await;
        assert!(run.is_success());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().never();
        let h = harness(executor);
        let cancel = Arc::new(CancellationToken::new());
        cancel.cancel("ctrl-c");

        let run = h.orchestrator.run(&firmware_pipeline(0), cancel).await;

        assert_eq!(
            statuses(&run),
            vec![StageStatus::Skipped, StageStatus::Skipped, StageStatus::Skipped]
        );
        assert!(run.cancelled);
        assert_eq!(run.abort_reason.as_deref(), Some("cancelled: ctrl-c"));
        assert_eq!(run.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_cancel_during_stage_skips_rest() {
        let cancel = Arc::new(CancellationToken::new());
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().times(1).returning(|stage, ctx| {
            ctx.cancel.cancel("stop requested");
            StageResult::cancelled(&stage.name, ctx.attempt, 1, String::new(), "stop requested")
        });
        let h = harness(executor);

        let run = h.orchestrator.run(&firmware_pipeline(0), cancel).await;

        assert_eq!(
            statuses(&run),
            vec![StageStatus::Failure, StageStatus::Skipped, StageStatus::Skipped]
        );
        assert_eq!(run.state, PipelineState::Aborted);
        assert_eq!(run.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_marks_stage_cancelled() {
        let cancel = Arc::new(CancellationToken::new());
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().times(1).returning(|stage, ctx| {
            StageResult::timeout(&stage.name, ctx.attempt, Duration::from_secs(1), 1000, String::new())
        });
        let h = harness(executor);
        let definition = PipelineDefinition::new("ci")
            .with_retry_config(RetryConfig::default().with_max_delay_ms(5_000).with_base_delay_ms(5_000))
            .with_stage(StageDefinition::new("hil", ["x"]).with_retry(true, 3))
            .with_stage(StageDefinition::new("report", ["y"]));

        let canceller = {
            let cancel = Arc::clone(&cancel);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel("ctrl-c");
            })
        };
        let started = std::time::Instant::now();
        let run = h.orchestrator.run(&definition, cancel).await;
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        let hil = run.record("hil").unwrap();
        assert_eq!(hil.attempts[0].status, StageStatus::Timeout);
        let last = hil.final_result().unwrap();
        assert_eq!(last.status, StageStatus::Failure);
        assert_eq!(last.failure_kind, Some(FailureKind::Cancelled));
        assert_eq!(last.error.as_deref(), Some("cancelled: ctrl-c"));
        assert_eq!(
            statuses(&run),
            vec![StageStatus::Failure, StageStatus::Skipped]
        );
        assert_eq!(run.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_failed_attempt_writes_are_not_propagated() {
        let mut executor = MockStageExecutor::new();
        executor.expect_execute().returning(|stage, ctx| {
            if stage.name == "setup" {
                let path = ctx.env.get(ENV_FILE_VAR).unwrap();
                if ctx.attempt == 1 {
                    std::fs::write(path, "SDK_DIR=/broken\nPARTIAL=1\n").unwrap();
                    return failed(stage, ctx);
                }
                std::fs::write(path, "SDK_DIR=/opt/sdk\n").unwrap();
            } else if stage.name == "prepare" {
                let path = ctx.env.get(ENV_FILE_VAR).unwrap();
                std::fs::write(path, "BOARD=nrf52840dk\n").unwrap();
            } else {
                assert_eq!(ctx.env.get("SDK_DIR").map(String::as_str), Some("/opt/sdk"));
                assert_eq!(ctx.env.get("BOARD").map(String::as_str), Some("nrf52840dk"));
                assert!(!ctx.env.contains_key("PARTIAL"));
            }
            ok(stage, ctx)
        });
        let h = harness(executor);
        let definition = PipelineDefinition::new("ci")
            .with_retry_config(RetryConfig::immediate())
            .with_stage(StageDefinition::new("setup", ["x"]).with_retry(true, 1))
            .with_stage(StageDefinition::new("prepare", ["y"]))
            .with_stage(StageDefinition::new("build", ["z"]));

        let run = h
            .orchestrator
            .run(&definition, Arc::new(CancellationToken::new()))
            .await;
        assert!(run.is_success());
    }

    #[test]
    fn test_describe_failure() {
        assert_eq!(
            describe_failure(&StageResult::failure("build", 1, None, 1, String::new())),
            "stage 'build' terminated by signal"
        );
        assert_eq!(
            describe_failure(&StageResult::launch_error("build", 1, "not found")),
            "stage 'build' could not be launched: not found"
        );
    }
}
