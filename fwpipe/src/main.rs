//! # run-pipeline
//!
//! Runs a firmware CI pipeline described by a TOML or JSON file.
//!
//! ```bash
//! run-pipeline --config firmware-ci.toml --report run.json
//! run-pipeline --config firmware-ci.toml --lock-dir /var/lock/fwpipe -v
//! ```
//!
//! Exit codes: 0 success, 1 stage failure, 2 configuration error,
//! 3 hardware unavailable, 130 cancelled.

mod cli;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    if let Err(e) = fwpipe::observability::init_logging(cli.log_format, cli.verbose) {
        eprintln!("failed to initialise logging: {e}");
    }

    let code = match cli::execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}
