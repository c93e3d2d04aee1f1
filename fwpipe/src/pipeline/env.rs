//! Stage environment assembly and the per-run env file.
//!
//! Stages can hand variables to later stages by appending `KEY=VALUE`
//! lines to the file named by `FWPIPE_ENV` (the same contract CI runners
//! use for persisting a freshly installed toolchain path). The file is
//! emptied before every attempt and read after every successful stage.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Variable naming the env file stages may append to.
pub const ENV_FILE_VAR: &str = "FWPIPE_ENV";
/// Variable carrying the run identifier.
pub const RUN_ID_VAR: &str = "FWPIPE_RUN_ID";
/// Variable carrying the stage name.
pub const STAGE_VAR: &str = "FWPIPE_STAGE";
/// Variable carrying the 1-indexed attempt number.
pub const ATTEMPT_VAR: &str = "FWPIPE_ATTEMPT";
/// Variable naming the hardware resource held by the stage.
pub const HARDWARE_VAR: &str = "FWPIPE_HARDWARE";

static ENV_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// Returns true if `key` is a portable environment variable name.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    ENV_KEY.is_match(key)
}

/// Parses `KEY=VALUE` lines.
///
/// Blank lines, `#` comments, lines without `=`, and invalid keys are
/// ignored. Later assignments override earlier ones.
#[must_use]
pub fn parse_env_lines(contents: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim_end_matches('\r');
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            debug!(line = %trimmed, "Ignoring env line without '='");
            continue;
        };
        let key = key.trim();
        if !is_valid_key(key) {
            warn!(key = %key, "Ignoring env line with invalid key");
            continue;
        }
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}

/// Per-run env file, removed when dropped.
#[derive(Debug)]
pub struct EnvFile {
    path: PathBuf,
}

impl EnvFile {
    /// Creates an empty env file for `run_id` inside `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(dir: &Path, run_id: Uuid) -> std::io::Result<Self> {
        let path = dir.join(format!("fwpipe-{run_id}.env"));
        std::fs::File::create(&path)?;
        Ok(Self { path })
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empties the file before an attempt.
    pub fn reset(&self) {
        if let Err(e) = std::fs::File::create(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to reset env file");
        }
    }

    /// Reads the variables written since the last reset.
    ///
    /// A missing or unreadable file yields no variables.
    #[must_use]
    pub fn read(&self) -> BTreeMap<String, String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => parse_env_lines(&contents),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read env file");
                BTreeMap::new()
            }
        }
    }
}

impl Drop for EnvFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove env file");
            }
        }
    }
}

/// Layers the environment for one stage attempt.
///
/// Later layers win: pipeline env, then propagated variables, then the
/// stage's own env, then the orchestrator's `FWPIPE_*` variables.
#[derive(Debug, Clone, Default)]
pub struct StageEnvironment {
    vars: BTreeMap<String, String>,
}

impl StageEnvironment {
    /// Starts from the pipeline-wide variables.
    #[must_use]
    pub fn new(pipeline_env: &BTreeMap<String, String>) -> Self {
        Self {
            vars: pipeline_env.clone(),
        }
    }

    /// Overlays a set of variables.
    #[must_use]
    pub fn overlay(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.vars
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Sets a single variable.
    #[must_use]
    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    /// Returns the assembled variables.
    #[must_use]
    pub fn into_vars(self) -> BTreeMap<String, String> {
        self.vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("ZEPHYR_SDK_INSTALL_DIR"));
        assert!(is_valid_key("_private"));
        assert!(is_valid_key("a1"));
        assert!(!is_valid_key("1abc"));
        assert!(!is_valid_key("BAD-KEY"));
        assert!(!is_valid_key(""));
    }

    #[test]
    fn test_parse_env_lines() {
        let vars = parse_env_lines(
            "# comment\n\nSDK_DIR=/opt/zephyr-sdk\r\nno_equals\nBAD-KEY=x\nEMPTY=\nSDK_DIR=/home/ci/zephyr-sdk\nURL=a=b\n",
        );

        let expected: BTreeMap<String, String> = [
            ("EMPTY", ""),
            ("SDK_DIR", "/home/ci/zephyr-sdk"),
            ("URL", "a=b"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(vars, expected);
    }

    #[test]
    fn test_env_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = Uuid::new_v4();
        let path;
        {
            let file = EnvFile::create(dir.path(), run_id).unwrap();
            path = file.path().to_path_buf();
            assert!(file.read().is_empty());

            std::fs::write(&path, "BOARD=nrf52840dk\n").unwrap();
            assert_eq!(file.read().get("BOARD").map(String::as_str), Some("nrf52840dk"));

            file.reset();
            assert!(path.exists());
            assert!(file.read().is_empty());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_stage_environment_precedence() {
        let pipeline: BTreeMap<_, _> = [("A".to_string(), "pipeline".to_string()), ("B".to_string(), "pipeline".to_string())].into();
        let propagated: BTreeMap<_, _> = [("B".to_string(), "propagated".to_string()), ("C".to_string(), "propagated".to_string())].into();
        let stage: BTreeMap<_, _> = [("C".to_string(), "stage".to_string())].into();

        let vars = StageEnvironment::new(&pipeline)
            .overlay(&propagated)
            .overlay(&stage)
            .set(STAGE_VAR, "build")
            .into_vars();

        assert_eq!(vars["A"], "pipeline");
        assert_eq!(vars["B"], "propagated");
        assert_eq!(vars["C"], "stage");
        assert_eq!(vars[STAGE_VAR], "build");
    }
}
