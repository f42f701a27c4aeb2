//! Verification gate: resolve, analyze, test and optional build.
//!
//! Classification rules:
//! - test failure is always hard
//! - analysis fails hard only on `error` markers; warning/info-only output
//!   passes in relaxed mode and fails in strict-lint mode
//! - build failure (when requested) is always hard
//! - resolution failure is hard and leaves the fingerprint unrecorded
//!
//! A stage that times out or cannot start is rerun up to the stage retry
//! bound before its result is classified.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use regex::Regex;
use stepwright_core::{
    tail_lines, with_retries, CheckResult, CheckStatus, FingerprintTracker, MetricsRecorder,
    RetryOutcome, RetryPolicy, Subject, VerificationResult, DEFAULT_TAIL_LINES,
};
use tracing::{debug, warn};

use crate::stage::{StageResult, ToolchainStage};
use crate::toolchain::Toolchain;

/// Diagnostic marker counts in a stage's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerCounts {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}

impl MarkerCounts {
    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.infos
    }
}

fn marker_regex() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?im)^\s*\[?(error|warning|warn|info)\b").expect("valid marker pattern")
    })
}

/// Count lines that start with an `error`, `warning` or `info` marker.
pub fn count_markers(output: &str) -> MarkerCounts {
    let mut counts = MarkerCounts::default();
    for caps in marker_regex().captures_iter(output) {
        match caps[1].to_ascii_lowercase().as_str() {
            "error" => counts.errors += 1,
            "warning" | "warn" => counts.warnings += 1,
            _ => counts.infos += 1,
        }
    }
    counts
}

/// Classify an analysis run.
///
/// A nonzero exit with no markers at all is a hard failure (the analyzer
/// itself broke).
pub fn classify_analysis(
    exit_code: Option<i32>,
    timed_out: bool,
    counts: MarkerCounts,
    strict_lint: bool,
) -> CheckStatus {
    if timed_out || counts.errors > 0 {
        return CheckStatus::FailedWithErrors;
    }
    let soft = counts.warnings + counts.infos;
    if strict_lint && soft > 0 {
        return CheckStatus::FailedWithWarningsOnly;
    }
    match exit_code {
        Some(0) => CheckStatus::Passed,
        _ if soft > 0 => CheckStatus::Passed,
        _ => CheckStatus::FailedWithErrors,
    }
}

fn classify_hard(result: &StageResult) -> CheckStatus {
    if result.passed() {
        CheckStatus::Passed
    } else {
        CheckStatus::FailedWithErrors
    }
}

/// Gate settings for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateRun {
    pub strict_lint: bool,
    pub include_build: bool,
}

/// The verification oracle shared by every step of a run.
pub struct VerificationGate {
    toolchain: Arc<dyn Toolchain>,
    fingerprint: Mutex<FingerprintTracker>,
    manifest: PathBuf,
    metrics: MetricsRecorder,
    tail_lines: usize,
    stage_retry: RetryPolicy,
}

impl VerificationGate {
    /// `manifest` is the dependency manifest whose fingerprint gates resolution.
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        fingerprint: FingerprintTracker,
        manifest: impl Into<PathBuf>,
        metrics: MetricsRecorder,
    ) -> Self {
        Self {
            toolchain,
            fingerprint: Mutex::new(fingerprint),
            manifest: manifest.into(),
            metrics,
            tail_lines: DEFAULT_TAIL_LINES,
            stage_retry: RetryPolicy::immediate(1),
        }
    }

    /// Bound for rerunning a stage that timed out or could not start.
    pub fn with_stage_retry(mut self, policy: RetryPolicy) -> Self {
        self.stage_retry = RetryPolicy {
            max_attempts: policy.max_attempts.max(1),
            ..policy
        };
        self
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, FingerprintTracker> {
        self.fingerprint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run every check and return a fresh result.
    pub async fn check(&self, run: GateRun) -> VerificationResult {
        let mut result = VerificationResult::default();

        let should_resolve = self.tracker().should_resolve(&self.manifest);
        if should_resolve {
            let stage = self.run(ToolchainStage::ResolveDependencies).await;
            result.resolve = self.to_check(&stage, classify_hard(&stage));
            if stage.passed() {
                self.tracker().record_resolved(&self.manifest);
            }
        } else {
            debug!(manifest = %self.manifest.display(), "manifest unchanged; skipping resolution");
        }

        let stage = self.run(ToolchainStage::Analyze).await;
        let counts = count_markers(&stage.output);
        let status = classify_analysis(stage.exit_code, stage.timed_out, counts, run.strict_lint);
        result.analyze = self.to_check(&stage, status);

        let stage = self.run(ToolchainStage::Test).await;
        result.test = self.to_check(&stage, classify_hard(&stage));

        if run.include_build {
            let stage = self.run(ToolchainStage::Build).await;
            result.build = self.to_check(&stage, classify_hard(&stage));
        }
        result
    }

    async fn run(&self, stage: ToolchainStage) -> StageResult {
        let outcome = with_retries(self.stage_retry, |attempt| async move {
            if attempt > 1 {
                debug!(stage = stage.name(), attempt, "rerunning toolchain stage");
            }
            match self.toolchain.run_stage(stage).await {
                Ok(result) if result.timed_out => Err(result),
                Ok(result) => Ok(result),
                Err(e) => {
                    warn!(stage = stage.name(), error = %e, "toolchain stage could not run");
                    Err(StageResult::unavailable(stage, &e))
                }
            }
        })
        .await;

        let result = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(stage = stage.name(), attempts, "toolchain stage never completed");
                last_error.unwrap_or_else(|| {
                    StageResult::unavailable(stage, &anyhow::anyhow!("stage was not attempted"))
                })
            }
        };
        if !result.skipped {
            let counts = count_markers(&result.output);
            self.metrics.record_with_markers(
                Subject::stage(stage.name()),
                Duration::from_millis(result.duration_ms),
                result.passed(),
                counts.errors,
                counts.warnings,
            );
        }
        result
    }

    fn to_check(&self, stage: &StageResult, status: CheckStatus) -> CheckResult {
        if stage.skipped {
            return CheckResult::not_run();
        }
        let counts = count_markers(&stage.output);
        CheckResult {
            status,
            exit_code: stage.exit_code,
            errors: counts.errors,
            warnings: counts.warnings,
            infos: counts.infos,
            timed_out: stage.timed_out,
            duration_ms: stage.duration_ms,
            tail: tail_lines(&stage.output, self.tail_lines),
        }
    }
}
