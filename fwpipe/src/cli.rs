//! Command-line interface for `run-pipeline`.

use anyhow::Context;
use clap::{ArgAction, Parser};
use fwpipe::cancellation::CancellationToken;
use fwpipe::config;
use fwpipe::events::LoggingEventSink;
use fwpipe::hardware::{HardwareLock, InProcessLocks, LockFileLocks};
use fwpipe::observability::LogFormat;
use fwpipe::pipeline::{Orchestrator, EXIT_CONFIG_ERROR, EXIT_SUCCESS};
use fwpipe::report::{self, ReportFormat};
use fwpipe::stages::ProcessExecutor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Run a firmware CI pipeline: build, unit test and hardware-in-the-loop stages.
#[derive(Parser, Debug)]
#[command(name = "run-pipeline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Pipeline configuration file (TOML or JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Also write the full run as JSON to this path
    #[arg(short, long)]
    pub report: Option<PathBuf>,

    /// Console report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,

    /// Coordinate hardware with other processes through lock files in this directory
    #[arg(long)]
    pub lock_dir: Option<PathBuf>,

    /// Validate the configuration and print the stage plan without running it
    #[arg(long)]
    pub dry_run: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Cancels `token` on Ctrl-C, or SIGTERM on unix.
fn spawn_signal_handler(token: Arc<CancellationToken>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => token.cancel("interrupted (SIGINT)"),
                        _ = term.recv() => token.cancel("terminated (SIGTERM)"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        token.cancel("interrupted (SIGINT)");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel("interrupted");
            }
        }
    });
}

/// Runs the CLI and returns the process exit code.
pub async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let definition = match config::load_from_path(&cli.config) {
        Ok(definition) => definition,
        Err(e) => {
            error!(path = %cli.config.display(), stages = ?e.stages, "Invalid configuration: {e}");
            eprintln!("configuration error: {e}");
            return Ok(EXIT_CONFIG_ERROR);
        }
    };

    if cli.dry_run {
        print!("{}", report::render_plan(&definition));
        return Ok(EXIT_SUCCESS);
    }

    let hardware: Arc<dyn HardwareLock> = match &cli.lock_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Using lock-file hardware locks");
            Arc::new(LockFileLocks::new(dir))
        }
        None => Arc::new(InProcessLocks::new()),
    };
    let orchestrator = Orchestrator::new(Arc::new(ProcessExecutor::new()), hardware)
        .with_event_sink(Arc::new(LoggingEventSink::debug()));

    let cancel = Arc::new(CancellationToken::new());
    cancel.on_cancel(|reason| warn!(reason, "Cancelling pipeline; remaining stages will be skipped"));
    spawn_signal_handler(Arc::clone(&cancel));

    let run = orchestrator.run(&definition, cancel).await;

    print!("{}", report::render(&run, cli.format)?);
    // The run's exit code stands even if the report file cannot be written.
    if let Some(path) = &cli.report {
        match report::write_json(&run, path)
            .with_context(|| format!("Failed to write report to {}", path.display()))
        {
            Ok(()) => info!(path = %path.display(), "Report written"),
            Err(e) => {
                error!(path = %path.display(), error = %format!("{e:#}"), "Report not written");
                eprintln!("warning: {e:#}");
            }
        }
    }
    Ok(run.exit_code())
}
