//! Logging setup for the `run-pipeline` binary.
//!
//! Logs go to stderr so stdout stays free for the report. `RUST_LOG`
//! overrides the verbosity flags.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Returns the default filter directive for a `-v` count.
#[must_use]
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "fwpipe=info,run_pipeline=info",
        1 => "fwpipe=debug,run_pipeline=debug",
        _ => "fwpipe=trace,run_pipeline=trace",
    }
}

/// Builds the filter, preferring `RUST_LOG` when set.
#[must_use]
pub fn build_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(format: LogFormat, verbose: u8) -> Result<(), TryInitError> {
    let filter = build_filter(verbose);
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
}
