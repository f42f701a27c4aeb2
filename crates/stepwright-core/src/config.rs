//! `stepwright.toml` configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) is a valid configuration. Relative paths are resolved against the
//! artifact root by the caller.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{PolicyConfig, Result, StepwrightError};
use crate::repair::RepairConfig;
use crate::reporting::AlertThresholds;

/// Completion sentinel the mutation agent is asked to print.
pub const DEFAULT_SENTINEL: &str = "~~STEPWRIGHT_DONE~~";

/// Output kept per stream, most recent bytes first.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepwrightConfig {
    pub policy: PolicyConfig,
    pub supervisor: SupervisorConfig,
    pub agent: AgentConfig,
    pub toolchain: ToolchainConfig,
    pub metrics: MetricsConfig,
    pub repair: RepairConfig,
    pub logging: LoggingConfig,
}

impl StepwrightConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            StepwrightError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.supervisor.timeout_secs == 0 {
            return Err(StepwrightError::Config(
                "supervisor.timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.supervisor.sentinel.trim().is_empty() {
            return Err(StepwrightError::Config(
                "supervisor.sentinel must not be empty".to_string(),
            ));
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(StepwrightError::Config(format!(
                "logging.level '{}' is not a log level",
                self.logging.level
            )));
        }
        for stage in [
            &self.toolchain.resolve,
            &self.toolchain.analyze,
            &self.toolchain.test,
            &self.toolchain.build,
        ] {
            if stage.enabled && stage.command.is_empty() {
                return Err(StepwrightError::Config(format!(
                    "toolchain stage '{}' is enabled but has no command",
                    stage.name
                )));
            }
        }
        Ok(())
    }
}

/// Process supervision limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Hard wall-clock limit per invocation.
    pub timeout_secs: u64,
    /// No output for this long counts as a timeout.
    pub idle_secs: Option<u64>,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    pub sentinel: String,
    pub max_output_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            idle_secs: None,
            kill_grace_ms: 2_000,
            sentinel: DEFAULT_SENTINEL.to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// How the rendered prompt reaches the agent process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVia {
    /// Appended as the final command-line argument.
    #[default]
    Arg,
    Stdin,
}

/// External mutation agent command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub prompt_via: PromptVia,
    /// A natural exit without the sentinel is a failed attempt.
    pub require_sentinel: bool,
    /// Per-invocation timeout; falls back to `supervisor.timeout_secs`.
    pub timeout_secs: Option<u64>,
}

/// One toolchain command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Program followed by its arguments.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_stage_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StageConfig {
    pub fn new(name: &str, command: &[&str], timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            timeout_secs,
            enabled: true,
        }
    }

    pub fn disabled(name: &str) -> Self {
        Self {
            name: name.to_string(),
            command: Vec::new(),
            timeout_secs: default_stage_timeout(),
            enabled: false,
        }
    }
}

fn default_stage_timeout() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Verification toolchain commands, run in the artifact root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Dependency manifest whose fingerprint gates resolution.
    pub manifest: PathBuf,
    /// Where the last resolved fingerprint is persisted.
    pub fingerprint_state: PathBuf,
    pub resolve: StageConfig,
    pub analyze: StageConfig,
    pub test: StageConfig,
    pub build: StageConfig,
    /// Command run as `<command> <feature>` for `feature` criteria; empty means none.
    pub feature_check: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("Cargo.toml"),
            fingerprint_state: PathBuf::from(".stepwright/manifest.sha256"),
            resolve: StageConfig::new("resolve", &["cargo", "fetch"], 600),
            analyze: StageConfig::new(
                "analyze",
                &["cargo", "clippy", "--all-targets", "--message-format", "short"],
                600,
            ),
            test: StageConfig::new("test", &["cargo", "test"], 900),
            build: StageConfig::new("build", &["cargo", "build", "--release"], 1_200),
            feature_check: Vec::new(),
        }
    }
}

/// Metrics ledger and run artifact locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub ledger: PathBuf,
    pub artifacts_dir: PathBuf,
    pub alerts: AlertThresholds,
    /// Days of history `report` and `dashboard` read; 0 reads the whole ledger.
    pub history_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ledger: PathBuf::from(".stepwright/metrics.jsonl"),
            artifacts_dir: PathBuf::from(".stepwright/runs"),
            alerts: AlertThresholds::default(),
            history_days: 30,
        }
    }
}

/// Log output of the `stepwright` binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the stepwright crates.
    pub level: String,
    /// Level for every other crate.
    pub dependency_level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dependency_level: "warn".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        let level = &self.level;
        format!(
            "{},stepwright={level},stepwright_core={level},stepwright_ci={level}",
            self.dependency_level
        )
    }
}

/// Resolve `path` against `root` unless it is already absolute.
pub fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
