//! Toolchain stage definitions and results.

use serde::{Deserialize, Serialize};
use stepwright_core::{StageConfig, ToolchainConfig};

/// Verification stages, in gate order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolchainStage {
    /// Fetch or install dependencies; gated by the manifest fingerprint.
    ResolveDependencies,

    /// Static analysis / lint pass.
    Analyze,

    /// Test pass.
    Test,

    /// Optional build pass.
    Build,
}

impl ToolchainStage {
    pub const ALL: [ToolchainStage; 4] = [
        ToolchainStage::ResolveDependencies,
        ToolchainStage::Analyze,
        ToolchainStage::Test,
        ToolchainStage::Build,
    ];

    /// Stage name used for metrics subjects and logs.
    pub fn name(&self) -> &'static str {
        match self {
            ToolchainStage::ResolveDependencies => "resolve",
            ToolchainStage::Analyze => "analyze",
            ToolchainStage::Test => "test",
            ToolchainStage::Build => "build",
        }
    }

    /// The configured command for this stage.
    pub fn config<'a>(&self, toolchain: &'a ToolchainConfig) -> &'a StageConfig {
        match self {
            ToolchainStage::ResolveDependencies => &toolchain.resolve,
            ToolchainStage::Analyze => &toolchain.analyze,
            ToolchainStage::Test => &toolchain.test,
            ToolchainStage::Build => &toolchain.build,
        }
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub stage: ToolchainStage,

    /// Exit code; `None` when the stage was skipped or killed.
    pub exit_code: Option<i32>,

    /// Combined stdout and stderr.
    pub output: String,

    pub timed_out: bool,

    pub duration_ms: u64,

    /// The stage is disabled and did not run.
    pub skipped: bool,
}

impl StageResult {
    pub fn skipped(stage: ToolchainStage) -> Self {
        Self {
            stage,
            exit_code: None,
            output: String::new(),
            timed_out: false,
            duration_ms: 0,
            skipped: true,
        }
    }

    /// A completed stage with the given exit code and output.
    pub fn finished(stage: ToolchainStage, exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            stage,
            exit_code: Some(exit_code),
            output: output.into(),
            timed_out: false,
            duration_ms: 0,
            skipped: false,
        }
    }

    /// A stage whose command could not be run at all.
    pub fn unavailable(stage: ToolchainStage, error: &anyhow::Error) -> Self {
        Self {
            stage,
            exit_code: None,
            output: format!("error: {error:#}"),
            timed_out: false,
            duration_ms: 0,
            skipped: false,
        }
    }

    /// Whether this stage passed (exit code 0, no timeout).
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        let names: Vec<_> = ToolchainStage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["resolve", "analyze", "test", "build"]);
    }

    #[test]
    fn test_stage_config_lookup() {
        let toolchain = ToolchainConfig::default();
        assert_eq!(ToolchainStage::Test.config(&toolchain).name, "test");
        assert_eq!(ToolchainStage::ResolveDependencies.config(&toolchain).command[1], "fetch");
    }

    #[test]
    fn test_stage_result_passed() {
        assert!(StageResult::finished(ToolchainStage::Test, 0, "ok").passed());
        assert!(!StageResult::finished(ToolchainStage::Test, 101, "FAILED").passed());

        let mut timed_out = StageResult::finished(ToolchainStage::Build, 0, "");
        timed_out.timed_out = true;
        assert!(!timed_out.passed());
    }

    #[test]
    fn test_skipped_stage() {
        let result = StageResult::skipped(ToolchainStage::Build);
        assert!(result.skipped);
        assert!(!result.passed());
    }
}
