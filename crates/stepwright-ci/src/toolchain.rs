//! Verification toolchain seam.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use stepwright_core::ToolchainConfig;
use tracing::debug;

use crate::stage::{StageResult, ToolchainStage};
use crate::supervisor::{CommandSpec, ProcessSupervisor, SupervisorLimits};

/// The project toolchain the gate runs against the artifact tree.
///
/// Implementations only execute commands and report exit code plus output;
/// classification is the gate's job.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Run one stage. A disabled stage returns [`StageResult::skipped`].
    async fn run_stage(&self, stage: ToolchainStage) -> Result<StageResult>;

    async fn resolve_dependencies(&self) -> Result<StageResult> {
        self.run_stage(ToolchainStage::ResolveDependencies).await
    }

    async fn analyze(&self) -> Result<StageResult> {
        self.run_stage(ToolchainStage::Analyze).await
    }

    async fn test(&self) -> Result<StageResult> {
        self.run_stage(ToolchainStage::Test).await
    }

    async fn build(&self) -> Result<StageResult> {
        self.run_stage(ToolchainStage::Build).await
    }
}

/// Toolchain that runs the configured commands in the artifact root.
pub struct CommandToolchain {
    root: PathBuf,
    config: ToolchainConfig,
    supervisor: Arc<ProcessSupervisor>,
    limits: SupervisorLimits,
}

impl CommandToolchain {
    /// `limits` supplies the kill grace and output bound; each stage uses its own timeout.
    pub fn new(
        root: impl Into<PathBuf>,
        config: ToolchainConfig,
        supervisor: Arc<ProcessSupervisor>,
        limits: SupervisorLimits,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            supervisor,
            limits: SupervisorLimits {
                idle: None,
                sentinel: None,
                ..limits
            },
        }
    }
}

#[async_trait]
impl Toolchain for CommandToolchain {
    async fn run_stage(&self, stage: ToolchainStage) -> Result<StageResult> {
        let stage_config = stage.config(&self.config);
        if !stage_config.enabled {
            debug!(stage = stage.name(), "skipping disabled stage");
            return Ok(StageResult::skipped(stage));
        }

        let spec = CommandSpec::from_argv(&stage_config.command, &self.root)?;
        let limits = self
            .limits
            .clone()
            .with_timeout(Duration::from_secs(stage_config.timeout_secs));
        let output = self.supervisor.run(&spec, &limits).await?;

        Ok(StageResult {
            stage,
            exit_code: output.exit_code,
            output: output.combined(),
            timed_out: output.timed_out(),
            duration_ms: output.duration.as_millis() as u64,
            skipped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwright_core::StageConfig;

    fn toolchain(dir: &std::path::Path, test_cmd: &[&str]) -> CommandToolchain {
        let config = ToolchainConfig {
            test: StageConfig::new("test", test_cmd, 30),
            build: StageConfig::disabled("build"),
            ..ToolchainConfig::default()
        };
        CommandToolchain::new(
            dir,
            config,
            Arc::new(ProcessSupervisor::new()),
            SupervisorLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_stage_runs_in_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let toolchain = toolchain(dir.path(), &["cat", "marker.txt"]);

        let result = toolchain.test().await.unwrap();
        assert!(result.passed());
        assert!(result.output.contains("present"));
    }

    #[tokio::test]
    async fn test_failing_stage_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = toolchain(dir.path(), &["sh", "-c", "echo 'error: boom' >&2; exit 3"]);

        let result = toolchain.test().await.unwrap();
        assert!(!result.passed());
        assert_eq!(result.exit_code, Some(3));
        assert!(result.output.contains("error: boom"));
    }

    #[tokio::test]
    async fn test_disabled_stage_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = toolchain(dir.path(), &["true"]);
        let result = toolchain.build().await.unwrap();
        assert!(result.skipped);
    }
}
