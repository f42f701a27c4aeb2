//! Pipeline run controller and step state machine.
//!
//! Each step moves through:
//! `Running -> StepVerifying -> [StepRemediating] -> StepValidating -> StepDone`
//! and the run ends in `FinalValidation -> RunComplete`, or `RunAborted`
//! when a strict policy flag turns an exhausted remediation into an abort.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use stepwright_core::obs::{
    emit_gate_evaluated, emit_run_finished, emit_run_started, emit_step_finished,
    emit_step_started, RunSpan,
};
use stepwright_core::{
    with_retries, AttemptOutcome, AttemptPhase, FailureKind, FingerprintTracker,
    MetricsRecorder, MetricsStore, PipelineRun, PolicyConfig, RepairConfig, RetryOutcome,
    RetryPolicy, RunCounters, RunReport, RunState, Step, StepManifest, StepOutcome, StepStatus,
    Subject, VerificationResult, DEFAULT_TAIL_LINES,
};
use tracing::{debug, error, info, warn, Instrument};

use crate::agent::{AgentOutcome, AgentRequest, MutationAgent};
use crate::gate::{GateRun, VerificationGate};
use crate::remediation::{invoke_agent, AttemptRecorder, RemediationLoop};
use crate::toolchain::Toolchain;
use crate::validators::ValidatorRegistry;

/// Drives one run of a step manifest against an artifact tree.
pub struct PipelineController {
    root: PathBuf,
    policy: PolicyConfig,
    agent: Arc<dyn MutationAgent>,
    toolchain: Arc<dyn Toolchain>,
    validators: Option<ValidatorRegistry>,
    metrics_store: Option<Arc<dyn MetricsStore>>,
    fingerprint: FingerprintTracker,
    dependency_manifest: PathBuf,
    repair: RepairConfig,
    tail_lines: usize,
}

impl PipelineController {
    pub fn new(
        root: impl Into<PathBuf>,
        policy: PolicyConfig,
        agent: Arc<dyn MutationAgent>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Self {
        let root = root.into();
        Self {
            dependency_manifest: root.join("Cargo.toml"),
            root,
            policy,
            agent,
            toolchain,
            validators: None,
            metrics_store: None,
            fingerprint: FingerprintTracker::in_memory(),
            repair: RepairConfig::default(),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = Some(validators);
        self
    }

    /// Ledger for step and stage records. Ignored when monitoring is disabled.
    pub fn with_metrics_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.metrics_store = Some(store);
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: FingerprintTracker) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Dependency manifest whose fingerprint gates resolution.
    pub fn with_dependency_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.dependency_manifest = manifest.into();
        self
    }

    pub fn with_repair(mut self, repair: RepairConfig) -> Self {
        self.repair = repair;
        self
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    /// Run every step in order. Always returns a report, whatever happened.
    pub async fn run(self, manifest: StepManifest) -> RunReport {
        let run = PipelineRun::new(manifest, self.policy.clone());
        let span = RunSpan::span(&run.run_id.to_string());
        self.execute(run).instrument(span).await
    }

    async fn execute(self, mut run: PipelineRun) -> RunReport {
        let run_id = run.run_id.to_string();
        let recorder = match (&self.metrics_store, self.policy.monitoring_enabled) {
            (Some(store), true) => MetricsRecorder::new(&run_id, Arc::clone(store)),
            _ => MetricsRecorder::disabled(&run_id),
        };
        let counters = Arc::new(RunCounters::new());
        let gate = Arc::new(
            VerificationGate::new(
                Arc::clone(&self.toolchain),
                self.fingerprint,
                self.dependency_manifest,
                recorder.clone(),
            )
            .with_tail_lines(self.tail_lines)
            .with_stage_retry(RetryPolicy::new(
                1 + self.policy.toolchain_retries,
                self.policy.retry_delay(),
            )),
        );
        let validators = Arc::new(
            self.validators
                .unwrap_or_else(|| ValidatorRegistry::new(&self.root)),
        );
        let gate_run = GateRun {
            strict_lint: self.policy.strict_linting,
            include_build: self.policy.run_build,
        };
        let remediation = RemediationLoop::new(
            &run_id,
            &self.root,
            Arc::clone(&self.agent),
            Arc::clone(&gate),
            Arc::clone(&validators),
            self.repair,
            gate_run,
            Arc::clone(&counters),
        )
        .with_tail_lines(self.tail_lines);

        let driver = StepDriver {
            run_id: &run_id,
            policy: &self.policy,
            agent: self.agent.as_ref(),
            gate: gate.as_ref(),
            gate_run,
            validators: validators.as_ref(),
            remediation: &remediation,
            recorder: &recorder,
            counters: counters.as_ref(),
        };

        emit_run_started(
            &run_id,
            run.manifest.len(),
            self.policy.strict_validation,
            self.policy.strict_linting,
        );
        let mut state = RunState::Pending;
        let mut aborted = false;

        let steps = run.manifest.steps.clone();
        for step in &steps {
            let outcome = driver.run_step(step, &mut state).await;
            let step_aborted = outcome.status == StepStatus::Aborted;
            if let Err(e) = run.append_outcome(outcome) {
                error!(step = step.index, error = %e, "step outcome rejected");
            }
            if step_aborted {
                aborted = true;
                driver.advance(&mut state, RunState::RunAborted(step.index));
                break;
            }
        }

        let final_validation = if aborted {
            None
        } else {
            driver.advance(&mut state, RunState::FinalValidation);
            Some(driver.final_validation().await)
        };
        if !aborted {
            driver.advance(&mut state, RunState::RunComplete);
        }

        let report = run.finish(aborted, final_validation);
        counters.flush(&run_id);
        emit_run_finished(
            &run_id,
            report.duration_ms,
            report.exit_code,
            report.degraded_steps().len(),
        );
        report
    }
}

/// Borrowed view of one run's collaborators.
struct StepDriver<'a> {
    run_id: &'a str,
    policy: &'a PolicyConfig,
    agent: &'a dyn MutationAgent,
    gate: &'a VerificationGate,
    gate_run: GateRun,
    validators: &'a ValidatorRegistry,
    remediation: &'a RemediationLoop,
    recorder: &'a MetricsRecorder,
    counters: &'a RunCounters,
}

impl StepDriver<'_> {
    fn advance(&self, state: &mut RunState, next: RunState) {
        debug!(from = ?state, to = ?next, "run state transition");
        *state = next;
    }

    async fn run_step(&self, step: &Step, state: &mut RunState) -> StepOutcome {
        let started = Instant::now();
        let index = step.index;
        let attempts = AttemptRecorder::new(index);
        let mut failures = Vec::new();
        let mut remediation_count = 0u32;
        let mut aborted = false;
        let mut degraded = false;

        // Running: mutation, retried while the agent times out or crashes.
        self.advance(state, RunState::Running(index));
        emit_step_started(self.run_id, index, &step.headline());
        if let RetryOutcome::Exhausted { attempts, .. } = self.mutate(step, &attempts).await {
            warn!(step = index, attempts, "mutation agent failed on every attempt");
            failures.push(FailureKind::TransientProcessFailure);
            degraded = true;
        }
        self.remediation.repair_layout(index);

        // StepVerifying
        self.advance(state, RunState::StepVerifying(index));
        let mut gate = self.gate.check(self.gate_run).await;
        emit_gate_evaluated(self.run_id, Some(index), gate.passed(), &gate.failed_checks());

        // StepRemediating
        if !gate.passed() {
            self.advance(state, RunState::StepRemediating(index));
            failures.push(FailureKind::VerificationFailure);
            let result = self
                .remediation
                .remediate(
                    step,
                    &gate.diagnostics(),
                    self.policy.max_remediation_attempts,
                    &attempts,
                )
                .await;
            remediation_count += result.attempts;
            if let Some(latest) = result.gate {
                gate = latest;
            }
            if !result.succeeded {
                if self.policy.aborts_on_exhaustion() {
                    error!(step = index, "remediation exhausted under strict policy; aborting run");
                    aborted = true;
                } else {
                    warn!(step = index, "remediation exhausted; continuing with degraded step");
                }
            }
        }

        // StepValidating
        let mut validation = None;
        if !aborted {
            self.advance(state, RunState::StepValidating(index));
            let kind = self.validators.resolve(step);
            debug!(step = index, kind = %kind.label(), "validating step");
            let mut report = self.validators.validate(&kind, step).await;
            if !report.passed {
                failures.push(FailureKind::ValidationFailure);
                let result = self
                    .remediation
                    .fix_validation(
                        step,
                        &kind,
                        &report,
                        self.policy.validation_fix_attempts,
                        &attempts,
                    )
                    .await;
                remediation_count += result.attempts;
                if let Some(latest) = result.gate {
                    gate = latest;
                }
                if let Some(latest) = result.validation {
                    report = latest;
                }
                if !report.passed {
                    if self.policy.strict_validation {
                        error!(step = index, "validation failed under strict policy; aborting run");
                        aborted = true;
                    } else {
                        warn!(step = index, "validation still failing; continuing");
                    }
                }
            }
            validation = Some(report);
        }

        let status = if aborted {
            StepStatus::Aborted
        } else if degraded
            || !gate.passed()
            || validation.as_ref().is_some_and(|v| !v.passed)
        {
            StepStatus::Degraded
        } else if remediation_count > 0 {
            StepStatus::Recovered
        } else {
            StepStatus::Clean
        };

        // StepDone
        self.advance(state, RunState::StepDone(index));
        let duration = started.elapsed();
        self.recorder.record_with_remediations(
            Subject::Step(index),
            duration,
            status.succeeded(),
            remediation_count,
        );
        self.counters.inc_steps();
        let attempts = attempts.seal().into_attempts();
        emit_step_finished(
            self.run_id,
            index,
            status,
            attempts.len(),
            duration.as_millis() as u64,
        );
        info!(
            step = index,
            status = status.label(),
            remediations = remediation_count,
            "step done"
        );

        StepOutcome {
            index,
            headline: step.headline(),
            status,
            attempts,
            remediation_count,
            gate: Some(gate),
            validation,
            failures,
            duration_ms: duration.as_millis() as u64,
        }
    }

    async fn mutate(
        &self,
        step: &Step,
        attempts: &AttemptRecorder,
    ) -> RetryOutcome<AgentOutcome, AgentOutcome> {
        let request = AgentRequest {
            step: step.index,
            phase: AttemptPhase::Mutation,
            instruction: step.instruction.clone(),
            context: None,
        };
        let request = &request;
        let policy = RetryPolicy::new(
            1 + self.policy.mutation_retries,
            self.policy.retry_delay(),
        );
        with_retries(policy, |attempt| async move {
            if attempt > 1 {
                let swept = self.agent.sweep();
                if swept > 0 {
                    warn!(step = step.index, swept, "killed leftover agent process groups");
                }
                debug!(step = step.index, attempt, "retrying failed mutation");
            }
            let outcome = invoke_agent(self.agent, request, attempts, self.counters).await;
            if outcome.outcome == AttemptOutcome::Succeeded {
                Ok(outcome)
            } else {
                Err(outcome)
            }
        })
        .await
    }

    async fn final_validation(&self) -> VerificationResult {
        let started = Instant::now();
        let result = self
            .gate
            .check(GateRun {
                strict_lint: self.policy.strict_linting,
                include_build: self.policy.final_build,
            })
            .await;
        self.recorder.record(
            Subject::stage("final_validation"),
            started.elapsed(),
            result.passed(),
        );
        emit_gate_evaluated(self.run_id, None, result.passed(), &result.failed_checks());
        result
    }
}

/// Collaborators for [`run_pipeline`].
pub struct Collaborators {
    pub root: PathBuf,
    pub agent: Arc<dyn MutationAgent>,
    pub toolchain: Arc<dyn Toolchain>,
    pub validators: Option<ValidatorRegistry>,
    pub metrics_store: Option<Arc<dyn MetricsStore>>,
    pub fingerprint: FingerprintTracker,
    /// Defaults to `<root>/Cargo.toml` when unset.
    pub dependency_manifest: Option<PathBuf>,
    pub repair: RepairConfig,
}

impl Collaborators {
    pub fn new(
        root: impl Into<PathBuf>,
        agent: Arc<dyn MutationAgent>,
        toolchain: Arc<dyn Toolchain>,
    ) -> Self {
        Self {
            root: root.into(),
            agent,
            toolchain,
            validators: None,
            metrics_store: None,
            fingerprint: FingerprintTracker::in_memory(),
            dependency_manifest: None,
            repair: RepairConfig::default(),
        }
    }
}

/// Run `manifest` under `policy` and return the run report.
pub async fn run_pipeline(
    manifest: StepManifest,
    policy: PolicyConfig,
    collaborators: Collaborators,
) -> RunReport {
    let Collaborators {
        root,
        agent,
        toolchain,
        validators,
        metrics_store,
        fingerprint,
        dependency_manifest,
        repair,
    } = collaborators;

    let mut controller = PipelineController::new(root, policy, agent, toolchain)
        .with_fingerprint(fingerprint)
        .with_repair(repair);
    if let Some(validators) = validators {
        controller = controller.with_validators(validators);
    }
    if let Some(store) = metrics_store {
        controller = controller.with_metrics_store(store);
    }
    if let Some(manifest_path) = dependency_manifest {
        controller = controller.with_dependency_manifest(manifest_path);
    }
    controller.run(manifest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageResult, ToolchainStage};
    use async_trait::async_trait;
    use stepwright_core::MemoryMetricsStore;

    struct NoopAgent;

    #[async_trait]
    impl MutationAgent for NoopAgent {
        async fn apply(&self, _request: &AgentRequest) -> anyhow::Result<AgentOutcome> {
            Ok(AgentOutcome::succeeded(0))
        }
    }

    struct GreenToolchain;

    #[async_trait]
    impl Toolchain for GreenToolchain {
        async fn run_stage(&self, stage: ToolchainStage) -> anyhow::Result<StageResult> {
            Ok(StageResult::finished(stage, 0, "ok"))
        }
    }

    fn policy() -> PolicyConfig {
        PolicyConfig {
            retry_delay_ms: 0,
            ..PolicyConfig::default()
        }
    }

    #[tokio::test]
    async fn test_clean_run_reports_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryMetricsStore::new());
        let manifest = StepManifest::from_instructions(["first", "second"]);

        let report = PipelineController::new(
            dir.path(),
            policy(),
            Arc::new(NoopAgent),
            Arc::new(GreenToolchain),
        )
        .with_metrics_store(store.clone())
        .run(manifest)
        .await;

        assert_eq!(report.exit_code, 0);
        assert_eq!(report.steps.len(), 2);
        for step in &report.steps {
            assert_eq!(step.status, StepStatus::Clean);
            assert_eq!(step.attempts.len(), 1);
            assert_eq!(step.attempts[0].outcome, AttemptOutcome::Succeeded);
        }
        assert!(report.final_validation.as_ref().unwrap().passed());

        let records = store.load().unwrap();
        let steps: Vec<_> = records.iter().filter(|r| r.subject.is_step()).collect();
        assert_eq!(steps.len(), 2);
        assert!(records.iter().all(|r| r.run_id == report.run_id));
    }

    #[tokio::test]
    async fn test_monitoring_disabled_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryMetricsStore::new());
        let policy = PolicyConfig {
            monitoring_enabled: false,
            ..policy()
        };

        let report = PipelineController::new(
            dir.path(),
            policy,
            Arc::new(NoopAgent),
            Arc::new(GreenToolchain),
        )
        .with_metrics_store(store.clone())
        .run(StepManifest::from_instructions(["only"]))
        .await;

        assert_eq!(report.exit_code, 0);
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_manifest_completes() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_pipeline(
            StepManifest::from_instructions(Vec::<String>::new()),
            policy(),
            Collaborators::new(dir.path(), Arc::new(NoopAgent), Arc::new(GreenToolchain)),
        )
        .await;
        assert_eq!(report.total_steps, 0);
        assert_eq!(report.exit_code, 0);
    }
}
