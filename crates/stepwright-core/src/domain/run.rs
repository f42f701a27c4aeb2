//! Pipeline runs, step outcomes and the run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attempt::Attempt;
use super::error::{FailureKind, Result, StepwrightError};
use super::policy::PolicyConfig;
use super::step::StepManifest;
use super::verification::{ValidationReport, VerificationResult};

/// Controller state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running(usize),
    StepVerifying(usize),
    StepRemediating(usize),
    StepValidating(usize),
    StepDone(usize),
    FinalValidation,
    RunComplete,
    RunAborted(usize),
}

/// Terminal status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Passed without any remediation.
    Clean,
    /// Passed after one or more remediation attempts.
    Recovered,
    /// Residual failure; the run continued past it.
    Degraded,
    /// Residual failure that aborted the run.
    Aborted,
}

impl StepStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, StepStatus::Clean | StepStatus::Recovered)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Clean => "clean",
            StepStatus::Recovered => "recovered",
            StepStatus::Degraded => "degraded",
            StepStatus::Aborted => "aborted",
        }
    }
}

/// Final recorded outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub headline: String,
    pub status: StepStatus,
    pub attempts: Vec<Attempt>,
    /// Remediation and validation-fix attempts made for this step.
    pub remediation_count: u32,
    pub gate: Option<VerificationResult>,
    pub validation: Option<ValidationReport>,
    pub failures: Vec<FailureKind>,
    pub duration_ms: u64,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    CompleteDegraded,
    Aborted,
}

impl RunStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Complete => 0,
            RunStatus::CompleteDegraded => 1,
            RunStatus::Aborted | RunStatus::Running => 2,
        }
    }
}

/// One invocation of the pipeline.
///
/// Immutable after creation except for appended step outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub policy: PolicyConfig,
    pub manifest: StepManifest,
    outcomes: Vec<StepOutcome>,
}

impl PipelineRun {
    pub fn new(manifest: StepManifest, policy: PolicyConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            policy,
            manifest,
            outcomes: Vec::new(),
        }
    }

    /// Append a step outcome. Outcomes must arrive in step order, once each.
    pub fn append_outcome(&mut self, outcome: StepOutcome) -> Result<()> {
        if self.outcomes.iter().any(|o| o.index == outcome.index) {
            return Err(StepwrightError::DuplicateOutcome(outcome.index));
        }
        let expected = self.outcomes.len() + 1;
        if outcome.index != expected {
            return Err(StepwrightError::InvalidStepIndex {
                index: outcome.index,
                len: self.manifest.len(),
            });
        }
        self.outcomes.push(outcome);
        Ok(())
    }

    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    /// Close the run and produce its report.
    pub fn finish(
        self,
        aborted: bool,
        final_validation: Option<VerificationResult>,
    ) -> RunReport {
        let degraded = self.outcomes.iter().any(|o| !o.status.succeeded())
            || final_validation.as_ref().is_some_and(|v| !v.passed());
        let status = if aborted {
            RunStatus::Aborted
        } else if degraded {
            RunStatus::CompleteDegraded
        } else {
            RunStatus::Complete
        };
        let finished_at = Utc::now();
        RunReport {
            run_id: self.run_id.to_string(),
            started_at: self.started_at,
            finished_at,
            duration_ms: (finished_at - self.started_at).num_milliseconds().max(0) as u64,
            total_steps: self.manifest.len(),
            status,
            exit_code: status.exit_code(),
            steps: self.outcomes,
            final_validation,
        }
    }
}

/// Summary handed back to the caller of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_steps: usize,
    pub status: RunStatus,
    pub exit_code: i32,
    pub steps: Vec<StepOutcome>,
    pub final_validation: Option<VerificationResult>,
}

impl RunReport {
    pub fn step(&self, index: usize) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn degraded_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|s| !s.status.succeeded())
            .map(|s| s.index)
            .collect()
    }

    pub fn total_remediations(&self) -> u32 {
        self.steps.iter().map(|s| s.remediation_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, status: StepStatus) -> StepOutcome {
        StepOutcome {
            index,
            headline: format!("step {index}"),
            status,
            attempts: Vec::new(),
            remediation_count: 0,
            gate: None,
            validation: None,
            failures: Vec::new(),
            duration_ms: 1,
        }
    }

    fn run(n: usize) -> PipelineRun {
        let manifest = StepManifest::from_instructions((1..=n).map(|i| format!("step {i}")));
        PipelineRun::new(manifest, PolicyConfig::default())
    }

    #[test]
    fn test_clean_run_exit_zero() {
        let mut run = run(2);
        run.append_outcome(outcome(1, StepStatus::Clean)).unwrap();
        run.append_outcome(outcome(2, StepStatus::Recovered)).unwrap();
        let report = run.finish(false, Some(VerificationResult::default()));
        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.exit_code, 0);
    }

    #[test]
    fn test_degraded_run_exit_one() {
        let mut run = run(2);
        run.append_outcome(outcome(1, StepStatus::Degraded)).unwrap();
        run.append_outcome(outcome(2, StepStatus::Clean)).unwrap();
        let report = run.finish(false, None);
        assert_eq!(report.status, RunStatus::CompleteDegraded);
        assert_eq!(report.exit_code, 1);
        assert_eq!(report.degraded_steps(), vec![1]);
    }

    #[test]
    fn test_aborted_run_exit_two() {
        let mut run = run(3);
        run.append_outcome(outcome(1, StepStatus::Aborted)).unwrap();
        let report = run.finish(true, None);
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.exit_code, 2);
    }

    #[test]
    fn test_outcome_recorded_once() {
        let mut run = run(2);
        run.append_outcome(outcome(1, StepStatus::Clean)).unwrap();
        let err = run.append_outcome(outcome(1, StepStatus::Clean)).unwrap_err();
        assert!(matches!(err, StepwrightError::DuplicateOutcome(1)));
    }

    #[test]
    fn test_outcomes_must_be_ordered() {
        let mut run = run(3);
        assert!(run.append_outcome(outcome(2, StepStatus::Clean)).is_err());
    }
}
