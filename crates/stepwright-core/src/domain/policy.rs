//! Run policy flags and bounds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy governing a pipeline run.
///
/// Passed into the controller at construction; the controller never reads
/// policy from anywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Abort the run when a step exhausts remediation or fails validation.
    pub strict_validation: bool,

    /// Treat analysis warnings as hard failures; also aborts on exhaustion.
    pub strict_linting: bool,

    /// Record metrics for this run.
    pub monitoring_enabled: bool,

    /// Remediation attempts after a failed gate.
    pub max_remediation_attempts: u32,

    /// Remediation attempts after a failed step validation.
    pub validation_fix_attempts: u32,

    /// Extra invocations of the initial mutation when it times out or crashes.
    pub mutation_retries: u32,

    /// Extra runs of a toolchain stage that timed out or could not start.
    pub toolchain_retries: u32,

    /// Delay between mutation and toolchain retries, in milliseconds.
    pub retry_delay_ms: u64,

    /// Include the build pass in every per-step gate run.
    pub run_build: bool,

    /// Include the build pass in the final aggregate validation.
    pub final_build: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            strict_validation: false,
            strict_linting: false,
            monitoring_enabled: true,
            max_remediation_attempts: 2,
            validation_fix_attempts: 1,
            mutation_retries: 2,
            toolchain_retries: 1,
            retry_delay_ms: 5_000,
            run_build: false,
            final_build: true,
        }
    }
}

impl PolicyConfig {
    /// Whether exhausting a bound escalates to a run-level abort.
    pub fn aborts_on_exhaustion(&self) -> bool {
        self.strict_validation || self.strict_linting
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Upper bound on attempts for a step whose mutation never fails.
    pub fn max_attempts_per_step(&self) -> u32 {
        1 + self.max_remediation_attempts + self.validation_fix_attempts
    }
}
