//! Domain-level error taxonomy for Stepwright.

use serde::{Deserialize, Serialize};

/// Failure categories observed while driving a pipeline.
///
/// These are recorded on attempts and step notes; none of them aborts a run
/// on its own. Only exhaustion under a strict policy escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout or crash of the mutation agent or a toolchain command.
    TransientProcessFailure,
    /// Hard analysis/test/build error reported by the gate.
    VerificationFailure,
    /// Self-nested artifact root, corrected automatically.
    StructuralDefect,
    /// Step-specific acceptance check missed.
    ValidationFailure,
    /// Metrics ledger write failed.
    PersistenceFailure,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientProcessFailure => "transient_process_failure",
            FailureKind::VerificationFailure => "verification_failure",
            FailureKind::StructuralDefect => "structural_defect",
            FailureKind::ValidationFailure => "validation_failure",
            FailureKind::PersistenceFailure => "persistence_failure",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stepwright domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StepwrightError {
    #[error("invalid step manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid step index {index} (pipeline has {len} steps)")]
    InvalidStepIndex { index: usize, len: usize },

    #[error("step {0} is already complete; no further attempts may be recorded")]
    StepAlreadyComplete(usize),

    #[error("outcome for step {0} was already recorded")]
    DuplicateOutcome(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("structural repair conflict at {path}: {reason}")]
    RepairConflict { path: String, reason: String },

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for StepwrightError {
    fn from(err: toml::de::Error) -> Self {
        StepwrightError::Config(err.to_string())
    }
}

/// Result type for Stepwright domain operations.
pub type Result<T> = std::result::Result<T, StepwrightError>;
