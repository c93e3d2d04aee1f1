//! Pipeline configuration files.
//!
//! A pipeline is described in TOML or JSON. The on-disk schema lives in
//! [`PipelineConfig`]; loading converts it into a validated
//! [`PipelineDefinition`] stamped with the SHA-256 of the source text.

use crate::core::StageKind;
use crate::errors::ConfigError;
use crate::pipeline::{
    HardwareSettings, PipelineDefinition, RetryConfig, StageDefinition, DEFAULT_ACQUIRE_TIMEOUT,
    DEFAULT_HARDWARE_RESOURCE, DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_STAGE_TIMEOUT,
};
use crate::utils::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Source format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML, the default.
    Toml,
    /// JSON.
    Json,
}

impl ConfigFormat {
    /// Picks the format from the file extension. Anything but `.json` is TOML.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,

    /// Environment shared by every stage.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Delay between attempts.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Hardware lock settings.
    #[serde(default)]
    pub hardware: HardwareConfig,

    /// Bound on captured output per attempt.
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,

    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// `[hardware]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    /// Resource for HIL stages that do not name one.
    #[serde(default = "default_resource")]
    pub default_resource: String,
    /// Seconds to wait for a busy resource.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            default_resource: default_resource(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

/// A stage command: an argv list, or a string run through `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Program followed by its arguments.
    Argv(Vec<String>),
    /// Shell script.
    Shell(String),
}

/// `[[stages]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Unique stage name.
    pub name: String,
    /// Command to run.
    pub command: CommandConfig,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Whether failures and timeouts may be retried.
    #[serde(default)]
    pub retryable: bool,
    /// Retries allowed after the first attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Stage kind; `hil` stages take the default hardware resource.
    #[serde(default)]
    pub kind: StageKind,
    /// Named hardware resource to hold while the stage runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

fn default_output_limit() -> usize {
    DEFAULT_OUTPUT_LIMIT_BYTES
}

fn default_resource() -> String {
    DEFAULT_HARDWARE_RESOURCE.to_string()
}

fn default_acquire_timeout_secs() -> f64 {
    DEFAULT_ACQUIRE_TIMEOUT.as_secs_f64()
}

fn default_timeout_secs() -> f64 {
    DEFAULT_STAGE_TIMEOUT.as_secs_f64()
}

fn seconds(value: f64, field: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ConfigError::new(format!("{field} must be a non-negative number, got {value}")))
}

impl StageConfig {
    fn into_definition(self) -> Result<StageDefinition, ConfigError> {
        let timeout = seconds(self.timeout_secs, "timeout_secs").map_err(|e| e.with_stage(&self.name))?;
        let mut stage = match self.command {
            CommandConfig::Argv(argv) => StageDefinition::new(self.name, argv),
            CommandConfig::Shell(script) => StageDefinition::shell(self.name, script),
        }
        .with_timeout(timeout)
        .with_retry(self.retryable, self.max_retries)
        .with_kind(self.kind);
        stage.hardware = self.hardware;
        stage.env = self.env;
        stage.working_dir = self.working_dir;
        Ok(stage)
    }
}

impl PipelineConfig {
    /// Converts the schema into a validated definition.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any value is out of range or the
    /// pipeline fails validation.
    pub fn into_definition(self) -> Result<PipelineDefinition, ConfigError> {
        let hardware = HardwareSettings {
            default_resource: self.hardware.default_resource,
            acquire_timeout: seconds(self.hardware.acquire_timeout_secs, "hardware.acquire_timeout_secs")?,
        };
        let stages = self
            .stages
            .into_iter()
            .map(StageConfig::into_definition)
            .collect::<Result<Vec<_>, _>>()?;

        let definition = PipelineDefinition {
            name: self.name,
            stages,
            env: self.env,
            retry: self.retry,
            hardware,
            output_limit_bytes: self.output_limit_bytes,
            source_digest: None,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Parses and validates a TOML pipeline.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the text does not parse or validate.
pub fn from_toml_str(contents: &str) -> Result<PipelineDefinition, ConfigError> {
    let config: PipelineConfig = toml::from_str(contents)
        .map_err(|e| ConfigError::new(format!("Failed to parse TOML: {e}")))?;
    config.into_definition()
}

/// Parses and validates a JSON pipeline.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the text does not parse or validate.
pub fn from_json_str(contents: &str) -> Result<PipelineDefinition, ConfigError> {
    let config: PipelineConfig = serde_json::from_str(contents)
        .map_err(|e| ConfigError::new(format!("Failed to parse JSON: {e}")))?;
    config.into_definition()
}

/// Loads a pipeline from disk, choosing the parser by extension.
///
/// # Errors
///
/// Returns a [`ConfigError`] carrying `path` if the file cannot be read,
/// parsed or validated.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<PipelineDefinition, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::new(format!("Failed to read {}: {e}", path.display())).with_path(path)
    })?;

    let parsed = match ConfigFormat::from_path(path) {
        ConfigFormat::Toml => from_toml_str(&contents),
        ConfigFormat::Json => from_json_str(&contents),
    };
    let mut definition = parsed.map_err(|e| e.with_path(path))?;
    definition.source_digest = Some(sha256_hex(contents.as_bytes()));

    debug!(
        path = %path.display(),
        pipeline = %definition.name,
        stages = definition.stages.len(),
        "Loaded pipeline config"
    );
    Ok(definition)
}
