//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan` RAII guard
//! - Emission functions for run, step, gate, remediation and repair events
//!
//! Events are emitted at `info!` level unless noted; set `RUST_LOG` to filter.

use tracing::{info, warn};

use crate::domain::{FailureKind, StepStatus};
use crate::metrics::Subject;

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("0b8e…");
/// // every event below now carries run_id
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: Self::span(run_id).entered(),
        }
    }

    /// The run span itself, for instrumenting a future.
    pub fn span(run_id: &str) -> tracing::Span {
        tracing::info_span!("stepwright.run", run_id = %run_id)
    }
}

pub fn emit_run_started(
    run_id: &str,
    total_steps: usize,
    strict_validation: bool,
    strict_linting: bool,
) {
    info!(
        event = "run.started",
        run_id = %run_id,
        total_steps,
        strict_validation,
        strict_linting,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, exit_code: i32, degraded_steps: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms,
        exit_code,
        degraded_steps,
    );
}

pub fn emit_step_started(run_id: &str, step: usize, headline: &str) {
    info!(event = "step.started", run_id = %run_id, step, headline = %headline);
}

pub fn emit_step_finished(
    run_id: &str,
    step: usize,
    status: StepStatus,
    attempts: usize,
    duration_ms: u64,
) {
    let status = status.label();
    info!(
        event = "step.finished",
        run_id = %run_id,
        step,
        status = %status,
        attempts,
        duration_ms,
    );
}

/// Gate verdict with the names of failing checks.
pub fn emit_gate_evaluated(
    run_id: &str,
    step: Option<usize>,
    passed: bool,
    failed_checks: &[&str],
) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        step = ?step,
        passed,
        failed = %failed_checks.join(","),
    );
}

/// Remediation attempt outcome (warning level when it failed).
pub fn emit_remediation_attempt(
    run_id: &str,
    step: usize,
    attempt: u32,
    max_attempts: u32,
    succeeded: bool,
) {
    if succeeded {
        info!(
            event = "remediation.attempt",
            run_id = %run_id,
            step,
            attempt,
            max_attempts,
            succeeded,
        );
    } else {
        warn!(
            event = "remediation.attempt",
            run_id = %run_id,
            step,
            attempt,
            max_attempts,
            succeeded,
        );
    }
}

pub fn emit_structural_repair(run_id: &str, step: usize, files_moved: usize, overwritten: usize) {
    info!(
        event = "repair.collapsed",
        run_id = %run_id,
        step,
        failure_kind = FailureKind::StructuralDefect.as_str(),
        files_moved,
        overwritten,
    );
}

/// Metrics ledger write failure (warning level, never propagated).
pub fn emit_persistence_error(run_id: &str, subject: &Subject, error: &dyn std::fmt::Display) {
    warn!(
        event = "metrics.persistence_error",
        run_id = %run_id,
        subject = %subject,
        failure_kind = FailureKind::PersistenceFailure.as_str(),
        error = %error,
    );
}
