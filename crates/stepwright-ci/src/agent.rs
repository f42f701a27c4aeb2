//! Mutation agent seam and the command-line agent adapter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use stepwright_core::{
    tail_lines, AgentConfig, AttemptOutcome, AttemptPhase, PromptVia, DEFAULT_TAIL_LINES,
};

use crate::supervisor::{CommandSpec, ExitReason, ProcessSupervisor, SupervisorLimits};

/// One invocation of the mutation agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub step: usize,
    pub phase: AttemptPhase,
    /// Opaque step instruction.
    pub instruction: String,
    /// Bounded failure context for remediation phases.
    pub context: Option<String>,
}

/// What the agent invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    pub sentinel_seen: bool,
    /// Bounded tail of the agent's output.
    pub transcript_tail: String,
}

impl AgentOutcome {
    pub fn succeeded(exit_code: i32) -> Self {
        Self {
            outcome: AttemptOutcome::Succeeded,
            exit_code: Some(exit_code),
            sentinel_seen: false,
            transcript_tail: String::new(),
        }
    }

    pub fn failed(exit_code: Option<i32>, transcript_tail: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Failed,
            exit_code,
            sentinel_seen: false,
            transcript_tail: transcript_tail.into(),
        }
    }

    pub fn timed_out(transcript_tail: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::TimedOut,
            exit_code: None,
            sentinel_seen: false,
            transcript_tail: transcript_tail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.outcome == AttemptOutcome::TimedOut
    }
}

/// External collaborator that edits the artifact tree.
#[async_trait]
pub trait MutationAgent: Send + Sync {
    /// Apply `request` to the artifact tree.
    ///
    /// `Err` means the agent could not be started at all; the controller
    /// records it as a failed attempt.
    async fn apply(&self, request: &AgentRequest) -> Result<AgentOutcome>;

    /// Kill anything left over from earlier invocations. Returns how many
    /// process groups were signalled.
    fn sweep(&self) -> usize {
        0
    }
}

/// Render the prompt handed to the agent process.
pub fn render_prompt(request: &AgentRequest, root: &Path, sentinel: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(request.instruction.trim_end());
    prompt.push_str("\n\n");

    if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        let heading = match request.phase {
            AttemptPhase::ValidationFix => {
                "The step's acceptance checks failed. Fix every item listed below:"
            }
            _ => "Verification failed after the previous change. Fix these problems:",
        };
        prompt.push_str(heading);
        prompt.push_str("\n\n");
        prompt.push_str(context.trim_end());
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "Rules:\n\
         - Operate in place in {}. Edit the existing project files directly.\n\
         - Do not create a new project and do not recreate this directory inside itself.\n\
         - Keep the change focused on this step.\n\
         - When you are done, print {} on its own line.\n",
        root.display(),
        sentinel
    ));
    prompt
}

/// Agent driven through an external command-line program.
pub struct CommandAgent {
    root: PathBuf,
    config: AgentConfig,
    supervisor: Arc<ProcessSupervisor>,
    limits: SupervisorLimits,
    sentinel: String,
    tail_lines: usize,
}

impl CommandAgent {
    pub fn new(
        root: impl Into<PathBuf>,
        config: AgentConfig,
        supervisor: Arc<ProcessSupervisor>,
        limits: SupervisorLimits,
    ) -> Result<Self> {
        if config.command.is_empty() {
            bail!("agent.command is not configured; set it in stepwright.toml");
        }
        let Some(sentinel) = limits.sentinel.clone() else {
            bail!("agent supervision requires a completion sentinel");
        };
        let limits = match config.timeout_secs {
            Some(secs) => limits.with_timeout(Duration::from_secs(secs)),
            None => limits,
        };
        Ok(Self {
            root: root.into(),
            config,
            supervisor,
            limits,
            sentinel,
            tail_lines: DEFAULT_TAIL_LINES,
        })
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }
}

#[async_trait]
impl MutationAgent for CommandAgent {
    async fn apply(&self, request: &AgentRequest) -> Result<AgentOutcome> {
        let prompt = render_prompt(request, &self.root, &self.sentinel);
        let spec = CommandSpec::from_argv(&self.config.command, &self.root)?;
        let spec = match self.config.prompt_via {
            PromptVia::Arg => spec.arg(prompt),
            PromptVia::Stdin => spec.stdin(prompt),
        };

        let output = self.supervisor.run(&spec, &self.limits).await?;
        let tail = tail_lines(&output.combined(), self.tail_lines);

        let mut outcome = match output.reason {
            ExitReason::TimedOut | ExitReason::IdleTimeout => AgentOutcome::timed_out(tail),
            ExitReason::SentinelSeen => AgentOutcome {
                outcome: AttemptOutcome::Succeeded,
                exit_code: Some(0),
                sentinel_seen: true,
                transcript_tail: tail,
            },
            ExitReason::Exited if output.exit_code == Some(0) && !self.config.require_sentinel => {
                AgentOutcome {
                    transcript_tail: tail,
                    ..AgentOutcome::succeeded(0)
                }
            }
            ExitReason::Exited => AgentOutcome::failed(output.exit_code, tail),
        };
        outcome.sentinel_seen = output.sentinel_seen();
        Ok(outcome)
    }

    fn sweep(&self) -> usize {
        self.supervisor.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwright_core::DEFAULT_SENTINEL;

    fn request(phase: AttemptPhase, context: Option<&str>) -> AgentRequest {
        AgentRequest {
            step: 2,
            phase,
            instruction: "Create src/cart.rs with a Cart struct".to_string(),
            context: context.map(str::to_string),
        }
    }

    fn agent(dir: &Path, command: &[&str], require_sentinel: bool) -> CommandAgent {
        let config = AgentConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            require_sentinel,
            ..AgentConfig::default()
        };
        let limits = SupervisorLimits::default().with_timeout(Duration::from_secs(20));
        CommandAgent::new(dir, config, Arc::new(ProcessSupervisor::new()), limits).unwrap()
    }

    #[test]
    fn test_prompt_carries_contract() {
        let prompt = render_prompt(
            &request(AttemptPhase::Mutation, None),
            Path::new("/work/app"),
            DEFAULT_SENTINEL,
        );
        assert!(prompt.starts_with("Create src/cart.rs"));
        assert!(prompt.contains("Operate in place in /work/app"));
        assert!(prompt.contains("do not recreate this directory inside itself"));
        assert!(prompt.contains(DEFAULT_SENTINEL));
        assert!(!prompt.contains("Fix these problems"));
    }

    #[test]
    fn test_prompt_includes_context_for_remediation() {
        let prompt = render_prompt(
            &request(AttemptPhase::Remediation, Some("[analyze]\nerror: missing ;")),
            Path::new("/work/app"),
            DEFAULT_SENTINEL,
        );
        assert!(prompt.contains("Fix these problems"));
        assert!(prompt.contains("[analyze]\nerror: missing ;"));

        let prompt = render_prompt(
            &request(AttemptPhase::ValidationFix, Some("[validation]\n- file_exists")),
            Path::new("/work/app"),
            DEFAULT_SENTINEL,
        );
        assert!(prompt.contains("acceptance checks failed"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = CommandAgent::new(
            "/tmp",
            AgentConfig::default(),
            Arc::new(ProcessSupervisor::new()),
            SupervisorLimits::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_prompt_passed_as_final_argument() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c script argv0 prompt`: the script writes $1 into the tree.
        let script = "printf '%s' \"$1\" > prompt.txt";
        let agent = agent(dir.path(), &["sh", "-c", script, "agent"], false);
        let outcome = agent
            .apply(&request(AttemptPhase::Mutation, None))
            .await
            .unwrap();

        assert_eq!(outcome.outcome, AttemptOutcome::Succeeded);
        let written = std::fs::read_to_string(dir.path().join("prompt.txt")).unwrap();
        assert!(written.starts_with("Create src/cart.rs"));
    }

    #[tokio::test]
    async fn test_require_sentinel_fails_natural_exit() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path(), &["sh", "-c", "echo done", "agent"], true);
        let outcome = agent
            .apply(&request(AttemptPhase::Mutation, None))
            .await
            .unwrap();
        assert_eq!(outcome.outcome, AttemptOutcome::Failed);
    }

    #[tokio::test]
    async fn test_sentinel_completes_lingering_agent() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!("echo working; echo {DEFAULT_SENTINEL}; sleep 30");
        let agent = agent(dir.path(), &["sh", "-c", &script, "agent"], true);
        let outcome = agent
            .apply(&request(AttemptPhase::Mutation, None))
            .await
            .unwrap();
        assert_eq!(outcome.outcome, AttemptOutcome::Succeeded);
        assert!(outcome.sentinel_seen);
        assert!(outcome.transcript_tail.contains("working"));
    }
}
