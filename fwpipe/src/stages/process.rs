//! Process-backed stage executor.

use super::{ExecutionContext, OutputBuffer, StageExecutor, StageResult};
use crate::pipeline::StageDefinition;
use crate::utils::duration_ms;
use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// How long to wait for output pipes to close after the process exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs stage commands as child process groups.
///
/// Each command is spawned in its own process group so that a timeout or
/// cancellation terminates everything the command started, not just the
/// direct child.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    kill_grace: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl ProcessExecutor {
    /// Creates an executor with the default kill grace period.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a terminated process may take to exit before SIGKILL.
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

enum ExitReason {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl StageExecutor for ProcessExecutor {
    async fn execute(&self, stage: &StageDefinition, ctx: &ExecutionContext) -> StageResult {
        let attempt = ctx.attempt;
        let Some((program, args)) = stage.command.split_first() else {
            return StageResult::launch_error(&stage.name, attempt, "empty command");
        };

        if ctx.cancel.is_cancelled() {
            let reason = ctx.cancel.reason().unwrap_or_default();
            return StageResult::cancelled(&stage.name, attempt, 0, String::new(), reason);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &stage.working_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(stage = %stage.name, program = %program, error = %e, "Failed to launch stage");
                return StageResult::launch_error(&stage.name, attempt, format!("{program}: {e}"));
            }
        };

        info!(
            stage = %stage.name,
            attempt,
            pid = ?child.id(),
            timeout_secs = stage.timeout.as_secs_f64(),
            "Stage process started"
        );

        let output = Arc::new(Mutex::new(OutputBuffer::new(ctx.output_limit_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.inner().stdout.take() {
            readers.push(spawn_reader(stdout, output.clone()));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            readers.push(spawn_reader(stderr, output.clone()));
        }

        // Captured now because the id is gone once the leader is reaped.
        let pgid = child.id();
        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitReason::Exited(status),
                Err(e) => ExitReason::WaitFailed(e),
            },
            () = tokio::time::sleep(stage.timeout) => ExitReason::TimedOut,
            () = ctx.cancel.cancelled() => ExitReason::Cancelled,
        };

        match exit {
            ExitReason::TimedOut | ExitReason::Cancelled => {
                terminate(&mut child, self.kill_grace).await;
            }
            ExitReason::Exited(_) => sweep_group(pgid),
            ExitReason::WaitFailed(_) => {}
        }
        let elapsed = duration_ms(started.elapsed());

        drain_readers(readers).await;
        let captured = std::mem::replace(&mut *output.lock(), OutputBuffer::new(1)).into_string();

        match exit {
            ExitReason::Exited(status) if status.success() => {
                debug!(stage = %stage.name, attempt, duration_ms = elapsed, "Stage process succeeded");
                StageResult::success(&stage.name, attempt, elapsed, captured)
            }
            ExitReason::Exited(status) => {
                info!(stage = %stage.name, attempt, exit_code = ?status.code(), "Stage process failed");
                StageResult::failure(&stage.name, attempt, status.code(), elapsed, captured)
            }
            ExitReason::WaitFailed(e) => {
                warn!(stage = %stage.name, error = %e, "Waiting on stage process failed");
                terminate(&mut child, Duration::ZERO).await;
                let mut result = StageResult::failure(&stage.name, attempt, None, elapsed, captured);
                result.error = Some(format!("wait failed: {e}"));
                result
            }
            ExitReason::TimedOut => {
                warn!(stage = %stage.name, attempt, timeout_secs = stage.timeout.as_secs_f64(), "Stage timed out");
                StageResult::timeout(&stage.name, attempt, stage.timeout, elapsed, captured)
            }
            ExitReason::Cancelled => {
                let reason = ctx.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                info!(stage = %stage.name, attempt, reason = %reason, "Stage cancelled");
                StageResult::cancelled(&stage.name, attempt, elapsed, captured, reason)
            }
        }
    }
}

fn spawn_reader<R>(stream: R, output: Arc<Mutex<OutputBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => output.lock().push_bytes(&line),
                Err(e) => {
                    warn!("error reading stage output: {}", e);
                    break;
                }
            }
        }
    })
}

/// Waits for the output readers, abandoning them if a stray descendant
/// keeps a pipe open past the drain window.
async fn drain_readers(readers: Vec<JoinHandle<()>>) {
    let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(readers))
        .await
        .is_err()
    {
        debug!("Output pipes still open after drain timeout; abandoning readers");
        for handle in aborts {
            handle.abort();
        }
    }
}

/// Terminates the process group and reaps the child.
#[cfg(unix)]
async fn terminate(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        let _ = child.wait().await;
        return;
    };
    let pgid = Pid::from_raw(pid);

    if !grace.is_zero() {
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pid, error = ?e, "SIGTERM to process group failed");
            }
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            // The leader is gone; sweep any descendants that ignored SIGTERM.
            let _ = killpg(pgid, Signal::SIGKILL);
            return;
        }
    }

    if let Err(e) = child.start_kill() {
        warn!(pid, error = %e, "SIGKILL to process group failed");
    }
    if let Err(e) = child.wait().await {
        warn!(pid, error = %e, "Failed to reap stage process");
    }
}

/// Kills whatever the stage left running in its process group after the
/// leader exited.
#[cfg(unix)]
fn sweep_group(pgid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pgid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "Killed processes left behind by stage"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = ?e, "SIGKILL to leftover process group failed"),
    }
}

#[cfg(not(unix))]
fn sweep_group(_pgid: Option<u32>) {}

#[cfg(not(unix))]
async fn terminate(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
