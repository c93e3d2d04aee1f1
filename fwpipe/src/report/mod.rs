//! Run reports: a console table and a JSON document.

use crate::core::StageStatus;
use crate::errors::PipelineError;
use crate::pipeline::{PipelineDefinition, PipelineRun, StageRecord};
use std::fmt::Write as _;
use std::path::Path;

/// Console report format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    /// Aligned table.
    #[default]
    Text,
    /// The full run as pretty-printed JSON.
    Json,
}

const HEADERS: [&str; 6] = ["STAGE", "STATUS", "ATTEMPTS", "EXIT", "DURATION", "NOTE"];

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

fn row(record: &StageRecord) -> [String; 6] {
    let result = record.final_result();
    let status = record.final_status();
    let exit = result
        .and_then(|r| r.exit_code)
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    let duration = if status == StageStatus::Skipped {
        "-".to_string()
    } else {
        format_duration(record.total_duration_ms())
    };
    let note = match result {
        Some(r) if r.failure_kind.is_some() => r.failure_kind.map(|k| k.to_string()).unwrap_or_default(),
        Some(r) if r.status == StageStatus::Timeout || r.status == StageStatus::Skipped => {
            r.error.clone().unwrap_or_default()
        }
        _ => String::new(),
    };
    [
        record.name.clone(),
        status.to_string(),
        record.attempt_count().to_string(),
        exit,
        duration,
        note,
    ]
}

/// One-line verdict for the run.
#[must_use]
pub fn summary_line(run: &PipelineRun) -> String {
    let verdict = if run.is_success() { "SUCCESS" } else { "FAILURE" };
    match &run.abort_reason {
        Some(reason) => format!(
            "Pipeline '{}' {verdict} ({}): {reason} [exit {}]",
            run.pipeline,
            run.state,
            run.exit_code()
        ),
        None => format!(
            "Pipeline '{}' {verdict} in {} [exit {}]",
            run.pipeline,
            format_duration(run.duration_ms()),
            run.exit_code()
        ),
    }
}

/// Renders the run as an aligned table followed by the summary line.
#[must_use]
pub fn render_text(run: &PipelineRun) -> String {
    let rows: Vec<[String; 6]> = run.records.iter().map(row).collect();
    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "Run {} ({})", run.run_id, run.pipeline);
    let header: Vec<String> = HEADERS.iter().map(|h| (*h).to_string()).collect();
    for cells in std::iter::once(&header[..]).chain(rows.iter().map(|r| &r[..])) {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    }
    let _ = writeln!(out, "{}", summary_line(run));
    out
}

/// Describes what a definition would run, without running it.
#[must_use]
pub fn render_plan(definition: &PipelineDefinition) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Pipeline '{}': {} stage(s)",
        definition.name,
        definition.stages.len()
    );
    for (index, stage) in definition.stages.iter().enumerate() {
        let _ = write!(
            out,
            "  {}. {} [{}] timeout {}s, up to {} attempt(s)",
            index + 1,
            stage.name,
            stage.kind,
            stage.timeout.as_secs_f64(),
            stage.max_attempts()
        );
        if let Some(resource) = stage.hardware_resource(&definition.hardware.default_resource) {
            let _ = write!(out, ", hardware '{resource}'");
        }
        let _ = writeln!(out, "\n     $ {}", stage.command.join(" "));
    }
    out
}

/// Renders the full run as pretty JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_json(run: &PipelineRun) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(run)
}

/// Renders the run in `format`.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render(run: &PipelineRun, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Text => Ok(render_text(run)),
        ReportFormat::Json => render_json(run),
    }
}

/// Writes the JSON report to `path`.
///
/// # Errors
///
/// Returns [`PipelineError::Io`] if the file cannot be written.
pub fn write_json(run: &PipelineRun, path: &Path) -> Result<(), PipelineError> {
    let json = render_json(run).map_err(std::io::Error::from)?;
    std::fs::write(path, json)?;
    Ok(())
}
