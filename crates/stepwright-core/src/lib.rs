//! Stepwright Core Library
//!
//! Domain model, configuration and the side-effect-light building blocks of
//! the pipeline engine: manifest fingerprinting, structural repair, the
//! bounded retry combinator, the metrics ledger and health reporting.

pub mod config;
pub mod domain;
pub mod fingerprint;
pub mod metrics;
pub mod obs;
pub mod repair;
pub mod reporting;
pub mod retry;
pub mod telemetry;

pub use config::{
    resolve_path, AgentConfig, LoggingConfig, MetricsConfig, PromptVia, StageConfig,
    StepwrightConfig, SupervisorConfig, ToolchainConfig, DEFAULT_MAX_OUTPUT_BYTES,
    DEFAULT_SENTINEL,
};
pub use domain::{
    tail_lines, Attempt, AttemptLog, AttemptOutcome, AttemptPhase, CheckResult, CheckStatus,
    Criterion, CriterionResult, FailureKind, PipelineRun, PolicyConfig, Result, RunReport,
    RunState, RunStatus, Step, StepManifest, StepOutcome, StepStatus, StepwrightError,
    ValidationReport, VerificationResult, DEFAULT_TAIL_LINES,
};
pub use fingerprint::{manifest_digest, FingerprintTracker};
pub use metrics::{
    JsonlMetricsStore, MemoryMetricsStore, MetricsRecord, MetricsRecorder, MetricsStore,
    RunCounters, Subject,
};
pub use repair::{default_markers, find_nested_root, repair_if_nested, RepairConfig, RepairReport};
pub use reporting::{
    aggregate, export_records, progress_bar, recent_records, render_dashboard,
    render_health_report, render_run_summary_md, write_run_artifacts, Alert, AlertKind,
    AlertSeverity, AlertThresholds, ExportFormat, HealthReport, RunHealth, SubjectStats,
};
pub use retry::{with_retries, RetryOutcome, RetryPolicy};
pub use telemetry::init_tracing;
