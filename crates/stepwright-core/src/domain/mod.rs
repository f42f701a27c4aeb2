//! Domain models for Stepwright.
//!
//! Canonical definitions for the core entities:
//! - `PipelineRun`: one invocation, with appended `StepOutcome`s
//! - `Step`: ordered instruction plus optional acceptance criteria
//! - `Attempt`: one mutation agent invocation
//! - `VerificationResult`: fresh gate verdict per invocation

pub mod attempt;
pub mod error;
pub mod policy;
pub mod run;
pub mod step;
pub mod verification;

pub use attempt::{Attempt, AttemptLog, AttemptOutcome, AttemptPhase};
pub use error::{FailureKind, Result, StepwrightError};
pub use policy::PolicyConfig;
pub use run::{PipelineRun, RunReport, RunState, RunStatus, StepOutcome, StepStatus};
pub use step::{Criterion, Step, StepManifest};
pub use verification::{
    tail_lines, CheckResult, CheckStatus, CriterionResult, ValidationReport, VerificationResult,
    DEFAULT_TAIL_LINES,
};
