//! Attempts: one record per mutation agent invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{FailureKind, Result, StepwrightError};

/// Why an attempt was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    /// Initial application of the step instruction.
    Mutation,
    /// Fix attempt after a failed verification gate.
    Remediation,
    /// Fix attempt after a failed step validation.
    ValidationFix,
}

/// Terminal outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// A completed attempt. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based position in the owning step's history.
    pub number: u32,
    pub phase: AttemptPhase,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub failure: Option<FailureKind>,
    /// Bounded tail of diagnostic text for this attempt.
    pub diagnostic_tail: String,
}

impl Attempt {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Causally ordered attempt history of a single step.
///
/// Once sealed, no further attempt can be appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLog {
    step_index: usize,
    attempts: Vec<Attempt>,
    sealed: bool,
}

impl AttemptLog {
    pub fn new(step_index: usize) -> Self {
        Self {
            step_index,
            attempts: Vec::new(),
            sealed: false,
        }
    }

    /// Append a completed attempt, assigning the next attempt number.
    pub fn record(
        &mut self,
        phase: AttemptPhase,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        failure: Option<FailureKind>,
        diagnostic_tail: impl Into<String>,
    ) -> Result<&Attempt> {
        if self.sealed {
            return Err(StepwrightError::StepAlreadyComplete(self.step_index));
        }
        let ended_at = Utc::now().max(started_at);
        let number = self.attempts.len() as u32 + 1;
        self.attempts.push(Attempt {
            number,
            phase,
            started_at,
            ended_at,
            outcome,
            failure,
            diagnostic_tail: diagnostic_tail.into(),
        });
        Ok(&self.attempts[self.attempts.len() - 1])
    }

    /// Mark the step complete.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn count_phase(&self, phase: AttemptPhase) -> usize {
        self.attempts.iter().filter(|a| a.phase == phase).count()
    }

    pub fn into_attempts(self) -> Vec<Attempt> {
        self.attempts
    }
}
