//! Bounded remediation: agent fix, structural repair, re-verify.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use stepwright_core::obs::{emit_remediation_attempt, emit_structural_repair};
use stepwright_core::{
    repair_if_nested, tail_lines, with_retries, AttemptLog, AttemptOutcome, AttemptPhase,
    FailureKind, RepairConfig, RetryPolicy, RunCounters, Step, ValidationReport,
    VerificationResult, DEFAULT_TAIL_LINES,
};
use tracing::warn;

use crate::agent::{AgentOutcome, AgentRequest, MutationAgent};
use crate::gate::{GateRun, VerificationGate};
use crate::validators::{StepKind, ValidatorRegistry};

/// Shared handle on one step's attempt log.
///
/// The log is sealed when the step completes; recording after that is
/// refused and logged.
pub struct AttemptRecorder {
    log: Mutex<AttemptLog>,
}

impl AttemptRecorder {
    pub fn new(step_index: usize) -> Self {
        Self {
            log: Mutex::new(AttemptLog::new(step_index)),
        }
    }

    fn log(&self) -> std::sync::MutexGuard<'_, AttemptLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a finished agent invocation.
    pub fn record(
        &self,
        phase: AttemptPhase,
        started_at: chrono::DateTime<Utc>,
        outcome: &AgentOutcome,
        failure: Option<FailureKind>,
    ) {
        let mut log = self.log();
        if let Err(e) = log.record(
            phase,
            started_at,
            outcome.outcome,
            failure,
            outcome.transcript_tail.clone(),
        ) {
            warn!(error = %e, "attempt rejected");
        }
    }

    pub fn len(&self) -> usize {
        self.log().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log().is_empty()
    }

    pub fn count_phase(&self, phase: AttemptPhase) -> usize {
        self.log().count_phase(phase)
    }

    /// Seal the log and hand back its attempts.
    pub fn seal(self) -> AttemptLog {
        let mut log = self.log.into_inner().unwrap_or_else(PoisonError::into_inner);
        log.seal();
        log
    }
}

/// Run one agent invocation and record it as an attempt.
///
/// A start failure becomes a failed attempt carrying the error text.
pub(crate) async fn invoke_agent(
    agent: &dyn MutationAgent,
    request: &AgentRequest,
    recorder: &AttemptRecorder,
    counters: &RunCounters,
) -> AgentOutcome {
    let started_at = Utc::now();
    let outcome = match agent.apply(request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                step = request.step,
                phase = ?request.phase,
                error = %e,
                "mutation agent failed to run"
            );
            AgentOutcome::failed(None, format!("{e:#}"))
        }
    };
    let failure = match outcome.outcome {
        AttemptOutcome::Succeeded => None,
        AttemptOutcome::Failed | AttemptOutcome::TimedOut => {
            Some(FailureKind::TransientProcessFailure)
        }
    };
    counters.inc_attempts();
    if outcome.is_timeout() {
        counters.inc_timeouts();
    }
    recorder.record(request.phase, started_at, &outcome, failure);
    outcome
}

/// Result of a remediation sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemediationResult {
    pub succeeded: bool,
    /// Agent invocations spent.
    pub attempts: u32,
    /// Gate result after the last attempt.
    pub gate: Option<VerificationResult>,
    /// Validation result after the last attempt (validation fixes only).
    pub validation: Option<ValidationReport>,
}

enum Acceptance<'a> {
    Gate,
    Validation(&'a StepKind),
}

/// What one remediation attempt left behind.
struct Verdict {
    gate: VerificationResult,
    validation: Option<ValidationReport>,
}

/// Remediation loop shared by gate failures and validation failures.
pub struct RemediationLoop {
    run_id: String,
    root: PathBuf,
    agent: Arc<dyn MutationAgent>,
    gate: Arc<VerificationGate>,
    validators: Arc<ValidatorRegistry>,
    repair: RepairConfig,
    gate_run: GateRun,
    counters: Arc<RunCounters>,
    tail_lines: usize,
}

impl RemediationLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        root: impl Into<PathBuf>,
        agent: Arc<dyn MutationAgent>,
        gate: Arc<VerificationGate>,
        validators: Arc<ValidatorRegistry>,
        repair: RepairConfig,
        gate_run: GateRun,
        counters: Arc<RunCounters>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            root: root.into(),
            agent,
            gate,
            validators,
            repair,
            gate_run,
            counters,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    /// Collapse a self-nested root after a mutation. Never fails the step.
    pub fn repair_layout(&self, step: usize) {
        match repair_if_nested(&self.root, &self.repair) {
            Ok(report) if report.repaired() => {
                self.counters.inc_repairs();
                emit_structural_repair(
                    &self.run_id,
                    step,
                    report.files_moved,
                    report.overwritten.len(),
                );
            }
            Ok(_) => {}
            Err(e) => warn!(step, error = %e, "structural repair failed; continuing"),
        }
    }

    /// Fix a failed gate. Stops at the first attempt after which the gate passes.
    pub async fn remediate(
        &self,
        step: &Step,
        diagnostics: &str,
        max_attempts: u32,
        recorder: &AttemptRecorder,
    ) -> RemediationResult {
        self.run(
            step,
            AttemptPhase::Remediation,
            diagnostics,
            max_attempts,
            recorder,
            Acceptance::Gate,
        )
        .await
    }

    /// Fix a failed step validation, re-validating with the same `kind`.
    pub async fn fix_validation(
        &self,
        step: &Step,
        kind: &StepKind,
        report: &ValidationReport,
        max_attempts: u32,
        recorder: &AttemptRecorder,
    ) -> RemediationResult {
        self.run(
            step,
            AttemptPhase::ValidationFix,
            &report.diagnostics(),
            max_attempts,
            recorder,
            Acceptance::Validation(kind),
        )
        .await
    }

    async fn run(
        &self,
        step: &Step,
        phase: AttemptPhase,
        diagnostics: &str,
        max_attempts: u32,
        recorder: &AttemptRecorder,
        acceptance: Acceptance<'_>,
    ) -> RemediationResult {
        // Failure context grows with every failed attempt, bounded to the tail.
        let context = Mutex::new(tail_lines(diagnostics, self.tail_lines));
        let last: Mutex<Option<Verdict>> = Mutex::new(None);
        let acceptance = &acceptance;
        let context_ref = &context;
        let last_ref = &last;

        let outcome = with_retries(RetryPolicy::immediate(max_attempts), |attempt| async move {
            let request = AgentRequest {
                step: step.index,
                phase,
                instruction: step.instruction.clone(),
                context: Some(lock(context_ref).clone()),
            };
            invoke_agent(self.agent.as_ref(), &request, recorder, &self.counters).await;
            self.counters.inc_remediations();
            self.repair_layout(step.index);

            let gate = self.gate.check(self.gate_run).await;
            let validation = match acceptance {
                Acceptance::Gate => None,
                Acceptance::Validation(kind) => Some(self.validators.validate(kind, step).await),
            };
            let accepted = match &validation {
                Some(report) => report.passed,
                None => gate.passed(),
            };
            emit_remediation_attempt(&self.run_id, step.index, attempt, max_attempts, accepted);

            if !accepted {
                let fresh = match &validation {
                    Some(report) => report.diagnostics(),
                    None => gate.diagnostics(),
                };
                let mut ctx = lock(context_ref);
                let merged = format!("{}\n\n[attempt {attempt}]\n{}", ctx.trim_end(), fresh);
                *ctx = tail_lines(&merged, self.tail_lines);
            }
            *lock(last_ref) = Some(Verdict { gate, validation });
            if accepted {
                Ok(())
            } else {
                Err(())
            }
        })
        .await;

        let last = last.into_inner().unwrap_or_else(PoisonError::into_inner);
        RemediationResult {
            succeeded: outcome.is_success(),
            attempts: outcome.attempts(),
            gate: last.as_ref().map(|v| v.gate.clone()),
            validation: last.and_then(|v| v.validation),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
