//! Pipeline and stage definitions.

use crate::core::StageKind;
use crate::errors::ConfigError;
use crate::hardware::is_valid_resource_name;
use crate::pipeline::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-stage timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default bound on captured output per attempt.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Default hardware resource for HIL stages that do not name one.
pub const DEFAULT_HARDWARE_RESOURCE: &str = "hil";

/// Default window for acquiring a hardware resource.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

/// Definition of a single stage. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// The unique name of the stage.
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Wall-clock bound on a single attempt.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Whether failed attempts may be retried.
    pub retryable: bool,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// The kind of stage.
    #[serde(default)]
    pub kind: StageKind,
    /// Exclusive hardware resource held while the stage runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    /// Extra environment variables for the command.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory for the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl StageDefinition {
    /// Creates a non-retryable stage with the default timeout.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            retryable: false,
            max_retries: 0,
            kind: StageKind::default(),
            hardware: None,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Creates a stage that runs `script` through `sh -c`.
    #[must_use]
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, ["sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retryable: bool, max_retries: u32) -> Self {
        self.retryable = retryable;
        self.max_retries = max_retries;
        self
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Names the hardware resource this stage holds.
    #[must_use]
    pub fn with_hardware(mut self, resource: impl Into<String>) -> Self {
        self.hardware = Some(resource.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Returns the hardware resource this stage must hold, if any.
    ///
    /// HIL stages without an explicit resource fall back to `default_resource`.
    #[must_use]
    pub fn hardware_resource<'a>(&'a self, default_resource: &'a str) -> Option<&'a str> {
        match (&self.hardware, self.kind.requires_hardware()) {
            (Some(resource), _) => Some(resource.as_str()),
            (None, true) => Some(default_resource),
            (None, false) => None,
        }
    }

    /// Maximum number of attempts the policy allows.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.retryable {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Validates the stage definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or command is empty, the timeout is
    /// zero, retries are configured on a non-retryable stage, or an env key
    /// is not a valid variable name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::new("Stage name cannot be empty"));
        }
        if self.command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ConfigError::new(format!("Stage '{}' has an empty command", self.name))
                .with_stage(&self.name));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::new(format!("Stage '{}' has a zero timeout", self.name))
                .with_stage(&self.name));
        }
        if !self.retryable && self.max_retries > 0 {
            return Err(ConfigError::new(format!(
                "Stage '{}' sets max_retries = {} but is not retryable",
                self.name, self.max_retries
            ))
            .with_stage(&self.name));
        }
        if let Some(key) = self.env.keys().find(|k| !crate::pipeline::env::is_valid_key(k)) {
            return Err(ConfigError::new(format!(
                "Stage '{}' has invalid environment variable name '{key}'",
                self.name
            ))
            .with_stage(&self.name));
        }
        if let Some(resource) = self.hardware.as_deref().filter(|r| !is_valid_resource_name(r)) {
            return Err(ConfigError::new(format!(
                "Stage '{}' has invalid hardware resource name '{resource}'",
                self.name
            ))
            .with_stage(&self.name));
        }
        Ok(())
    }
}

/// Hardware settings shared by all stages of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSettings {
    /// Resource used by HIL stages that do not name one.
    pub default_resource: String,
    /// How long to wait for a busy resource before failing.
    #[serde(with = "duration_secs")]
    pub acquire_timeout: Duration,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            default_resource: DEFAULT_HARDWARE_RESOURCE.to_string(),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// A validated, ordered pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// The pipeline name.
    pub name: String,
    /// Stages in execution order.
    pub stages: Vec<StageDefinition>,
    /// Environment shared by every stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Delay policy between attempts.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Hardware lock settings.
    #[serde(default)]
    pub hardware: HardwareSettings,
    /// Bound on captured output per attempt.
    pub output_limit_bytes: usize,
    /// SHA-256 of the configuration source, when loaded from a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
}

impl PipelineDefinition {
    /// Creates an empty pipeline definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            env: BTreeMap::new(),
            retry: RetryConfig::default(),
            hardware: HardwareSettings::default(),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            source_digest: None,
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the retry delay policy.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the hardware settings.
    #[must_use]
    pub fn with_hardware(mut self, hardware: HardwareSettings) -> Self {
        self.hardware = hardware;
        self
    }

    /// Adds a pipeline-wide environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the output limit.
    #[must_use]
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Validates the whole pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank, there are no stages, names
    /// collide, any stage is invalid, or settings are out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::new(
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }
        if self.stages.is_empty() {
            return Err(ConfigError::new(format!(
                "Pipeline '{}' defines no stages",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::new(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                ))
                .with_stage(&stage.name));
            }
        }

        if let Some(key) = self.env.keys().find(|k| !crate::pipeline::env::is_valid_key(k)) {
            return Err(ConfigError::new(format!(
                "Pipeline env has invalid variable name '{key}'"
            )));
        }
        if !is_valid_resource_name(&self.hardware.default_resource) {
            return Err(ConfigError::new(format!(
                "hardware.default_resource '{}' is not a valid resource name",
                self.hardware.default_resource
            )));
        }
        if self.output_limit_bytes == 0 {
            return Err(ConfigError::new("output_limit_bytes must be greater than zero"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::new(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Serializes a [`Duration`] as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
