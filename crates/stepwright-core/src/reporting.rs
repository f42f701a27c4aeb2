//! Pipeline health aggregation and report artifacts.
//!
//! Provides:
//! - `HealthReport`: per-subject and per-run aggregates over the metrics ledger,
//!   with threshold alerts and recommendations
//! - text renderers for the health report, the dashboard and the run summary
//! - ledger export as JSON or CSV
//! - `<dir>/<run_id>/run_report.json` and `<dir>/<run_id>/summary.md` artifacts

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Result, RunReport, StepwrightError};
use crate::metrics::{MetricsRecord, Subject};

// ── aggregation ───────────────────────────────────────────────────────────

/// Aggregates for one subject across every run in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStats {
    pub subject: Subject,
    pub count: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub mean_duration_ms: f64,
    pub max_duration_ms: u64,
    pub remediations: u32,
}

/// Aggregates for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHealth {
    pub run_id: String,
    pub first_seen: DateTime<Utc>,
    pub steps: usize,
    pub successful_steps: usize,
    /// Steps that succeeded without any remediation.
    pub clean_steps: usize,
    pub remediated_steps: usize,
    pub step_duration_ms: u64,
    pub max_step_duration_ms: u64,
    /// `error` markers across the run's stage output.
    #[serde(default)]
    pub errors: usize,
    #[serde(default)]
    pub warnings: usize,
    /// Fraction of steps completed without remediation.
    pub health_score: f64,
}

impl RunHealth {
    pub fn success_rate(&self) -> f64 {
        ratio(self.successful_steps, self.steps)
    }

    pub fn remediation_rate(&self) -> f64 {
        ratio(self.remediated_steps, self.steps)
    }

    /// Share of errors among error and warning markers.
    pub fn error_rate(&self) -> f64 {
        ratio(self.errors, self.errors + self.warnings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowSuccessRate,
    SlowStep,
    HighRemediationRate,
    HighErrorRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Alert thresholds applied to the latest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub min_success_rate: f64,
    pub max_step_duration_ms: u64,
    pub max_remediation_rate: f64,
    pub max_error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            max_step_duration_ms: 600_000,
            max_remediation_rate: 0.5,
            max_error_rate: 0.1,
        }
    }
}

/// Ledger-wide health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub total_records: usize,
    pub subjects: Vec<SubjectStats>,
    /// Runs ordered oldest first.
    pub runs: Vec<RunHealth>,
    /// Mean run health score, 0.0 when the ledger has no step records.
    pub overall_health: f64,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
}

impl HealthReport {
    pub fn latest_run(&self) -> Option<&RunHealth> {
        self.runs.last()
    }
}

/// Keep the records of the last `days` days. Zero keeps the whole ledger.
pub fn recent_records(
    records: Vec<MetricsRecord>,
    days: u32,
    now: DateTime<Utc>,
) -> Vec<MetricsRecord> {
    if days == 0 {
        return records;
    }
    records
        .into_iter()
        .filter(|r| r.within_days(days, now))
        .collect()
}

/// Aggregate ledger records into a health report.
pub fn aggregate(records: &[MetricsRecord], thresholds: &AlertThresholds) -> HealthReport {
    let mut by_subject: BTreeMap<Subject, Vec<&MetricsRecord>> = BTreeMap::new();
    let mut by_run: BTreeMap<&str, Vec<&MetricsRecord>> = BTreeMap::new();
    for record in records {
        by_subject.entry(record.subject.clone()).or_default().push(record);
        by_run.entry(record.run_id.as_str()).or_default().push(record);
    }

    let subjects = by_subject
        .into_iter()
        .map(|(subject, rows)| {
            let count = rows.len();
            let successes = rows.iter().filter(|r| r.success).count();
            let total: u64 = rows.iter().map(|r| r.duration_ms).sum();
            SubjectStats {
                subject,
                count,
                successes,
                success_rate: ratio(successes, count),
                mean_duration_ms: if count == 0 { 0.0 } else { total as f64 / count as f64 },
                max_duration_ms: rows.iter().map(|r| r.duration_ms).max().unwrap_or(0),
                remediations: rows.iter().map(|r| r.remediations).sum(),
            }
        })
        .collect();

    let mut runs: Vec<RunHealth> = by_run
        .into_iter()
        .filter_map(|(run_id, rows)| {
            let first_seen = rows.iter().map(|r| r.timestamp).min()?;
            let steps: Vec<&&MetricsRecord> = rows.iter().filter(|r| r.subject.is_step()).collect();
            let successful_steps = steps.iter().filter(|r| r.success).count();
            let clean_steps = steps
                .iter()
                .filter(|r| r.success && r.remediations == 0)
                .count();
            Some(RunHealth {
                run_id: run_id.to_string(),
                first_seen,
                steps: steps.len(),
                successful_steps,
                clean_steps,
                remediated_steps: steps.iter().filter(|r| r.remediations > 0).count(),
                step_duration_ms: steps.iter().map(|r| r.duration_ms).sum(),
                max_step_duration_ms: steps.iter().map(|r| r.duration_ms).max().unwrap_or(0),
                errors: rows.iter().map(|r| r.errors).sum(),
                warnings: rows.iter().map(|r| r.warnings).sum(),
                health_score: ratio(clean_steps, steps.len()),
            })
        })
        .collect();
    runs.sort_by_key(|r| r.first_seen);

    let scored: Vec<f64> = runs
        .iter()
        .filter(|r| r.steps > 0)
        .map(|r| r.health_score)
        .collect();
    let overall_health = if scored.is_empty() {
        0.0
    } else {
        scored.iter().sum::<f64>() / scored.len() as f64
    };

    let alerts = runs
        .last()
        .map(|latest| check_alerts(latest, thresholds))
        .unwrap_or_default();
    let recommendations = recommendations(&alerts);

    HealthReport {
        generated_at: Utc::now(),
        total_records: records.len(),
        subjects,
        runs,
        overall_health,
        alerts,
        recommendations,
    }
}

fn check_alerts(run: &RunHealth, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    let success_rate = run.success_rate();
    if run.steps > 0 && success_rate < thresholds.min_success_rate {
        let severity = if success_rate < thresholds.min_success_rate / 2.0 {
            AlertSeverity::Error
        } else {
            AlertSeverity::Warning
        };
        alerts.push(Alert {
            kind: AlertKind::LowSuccessRate,
            severity,
            message: format!(
                "Step success rate {:.1}% is below threshold {:.1}%",
                success_rate * 100.0,
                thresholds.min_success_rate * 100.0
            ),
        });
    }

    if run.max_step_duration_ms > thresholds.max_step_duration_ms {
        alerts.push(Alert {
            kind: AlertKind::SlowStep,
            severity: AlertSeverity::Warning,
            message: format!(
                "Slowest step took {:.1}s, above threshold {:.1}s",
                run.max_step_duration_ms as f64 / 1000.0,
                thresholds.max_step_duration_ms as f64 / 1000.0
            ),
        });
    }

    let remediation_rate = run.remediation_rate();
    if remediation_rate > thresholds.max_remediation_rate {
        alerts.push(Alert {
            kind: AlertKind::HighRemediationRate,
            severity: AlertSeverity::Warning,
            message: format!(
                "{:.1}% of steps needed remediation (threshold {:.1}%)",
                remediation_rate * 100.0,
                thresholds.max_remediation_rate * 100.0
            ),
        });
    }

    // Markers come from stage records, so this runs even without step rows.
    if run.errors + run.warnings > 0 && run.error_rate() > thresholds.max_error_rate {
        alerts.push(Alert {
            kind: AlertKind::HighErrorRate,
            severity: AlertSeverity::Error,
            message: format!(
                "Error rate {:.1}% exceeds threshold {:.1}% ({} errors, {} warnings)",
                run.error_rate() * 100.0,
                thresholds.max_error_rate * 100.0,
                run.errors,
                run.warnings
            ),
        });
    }
    alerts
}

fn recommendations(alerts: &[Alert]) -> Vec<String> {
    let mut recs: Vec<String> = alerts
        .iter()
        .map(|a| match a.kind {
            AlertKind::LowSuccessRate => {
                "Improve pipeline reliability by fixing the steps that end degraded".to_string()
            }
            AlertKind::SlowStep => {
                "Split long steps or raise the agent timeout for heavy steps".to_string()
            }
            AlertKind::HighRemediationRate => {
                "Tighten step instructions so the first mutation passes the gate".to_string()
            }
            AlertKind::HighErrorRate => {
                "Fix analyzer errors before adding steps; they block every gate run".to_string()
            }
        })
        .collect();
    recs.dedup();
    if recs.is_empty() {
        recs.push("Pipeline is performing well - maintain current practices".to_string());
    }
    recs
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

// ── rendering ─────────────────────────────────────────────────────────────

/// Render the health report as plain text.
pub fn render_health_report(report: &HealthReport) -> String {
    let rule = "=".repeat(72);
    let mut out = format!("{rule}\nPIPELINE HEALTH REPORT\n{rule}\n");
    out.push_str(&format!(
        "Generated: {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!(
        "Runs: {}  Records: {}\n",
        report.runs.len(),
        report.total_records
    ));
    out.push_str(&format!(
        "\nOVERALL HEALTH SCORE: {:.1}/100\n",
        report.overall_health * 100.0
    ));

    if let Some(latest) = report.latest_run() {
        out.push_str(&format!("\nLATEST RUN {}\n", latest.run_id));
        out.push_str(&format!(
            "  Steps: {} ({} clean, {} remediated)\n",
            latest.steps, latest.clean_steps, latest.remediated_steps
        ));
        out.push_str(&format!(
            "  Success rate: {:.1}%\n",
            latest.success_rate() * 100.0
        ));
        out.push_str(&format!(
            "  Step time: {:.1}s\n",
            latest.step_duration_ms as f64 / 1000.0
        ));
        out.push_str(&format!(
            "  Errors: {}  Warnings: {}\n",
            latest.errors, latest.warnings
        ));
    }

    if !report.subjects.is_empty() {
        out.push_str("\nSUBJECTS\n");
        for s in &report.subjects {
            out.push_str(&format!(
                "  {:<20} n={:<4} ok={:>5.1}% mean={:>8.0}ms max={:>8}ms\n",
                s.subject.to_string(),
                s.count,
                s.success_rate * 100.0,
                s.mean_duration_ms,
                s.max_duration_ms
            ));
        }
    }

    if report.alerts.is_empty() {
        out.push_str("\nNO ACTIVE ALERTS\n");
    } else {
        out.push_str(&format!("\nACTIVE ALERTS ({})\n", report.alerts.len()));
        for alert in &report.alerts {
            let tag = match alert.severity {
                AlertSeverity::Error => "ERROR",
                AlertSeverity::Warning => "WARN ",
            };
            out.push_str(&format!("  [{tag}] {}\n", alert.message));
        }
    }

    out.push_str("\nRECOMMENDATIONS\n");
    for rec in &report.recommendations {
        out.push_str(&format!("  - {rec}\n"));
    }
    out.push_str(&rule);
    out.push('\n');
    out
}

/// Fixed-width progress bar for a fraction in `[0, 1]`.
pub fn progress_bar(fraction: f64, width: usize) -> String {
    let filled = ((fraction.clamp(0.0, 1.0)) * width as f64).round() as usize;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

/// Render a compact boxed dashboard for the latest run.
pub fn render_dashboard(report: &HealthReport) -> String {
    const WIDTH: usize = 64;
    let border = format!("+{}+", "-".repeat(WIDTH));
    let line = |text: String| format!("| {:<width$} |\n", text, width = WIDTH - 2);

    let mut out = format!("{border}\n");
    out.push_str(&line("STEPWRIGHT PIPELINE DASHBOARD".to_string()));
    out.push_str(&format!("{border}\n"));
    out.push_str(&line(format!(
        "Health     {:>5.1}%  {}",
        report.overall_health * 100.0,
        progress_bar(report.overall_health, 24)
    )));

    match report.latest_run() {
        Some(latest) => {
            out.push_str(&line(format!(
                "Success    {:>5.1}%  {}",
                latest.success_rate() * 100.0,
                progress_bar(latest.success_rate(), 24)
            )));
            out.push_str(&line(format!(
                "Remediated {:>5.1}%  {}",
                latest.remediation_rate() * 100.0,
                progress_bar(latest.remediation_rate(), 24)
            )));
            out.push_str(&format!("{border}\n"));
            out.push_str(&line(format!("Run  {}", latest.run_id)));
            out.push_str(&line(format!(
                "Steps {}  clean {}  time {:.1}s",
                latest.steps,
                latest.clean_steps,
                latest.step_duration_ms as f64 / 1000.0
            )));
            out.push_str(&line(format!(
                "Errors {}  warnings {}",
                latest.errors, latest.warnings
            )));
        }
        None => out.push_str(&line("No runs recorded".to_string())),
    }
    out.push_str(&line(format!("Alerts {}", report.alerts.len())));
    out.push_str(&format!("{border}\n"));
    out
}

/// Render a run report as a Markdown summary.
pub fn render_run_summary_md(report: &RunReport) -> String {
    let mut md = format!("# Pipeline Run {}\n\n", report.run_id);
    md.push_str(&format!(
        "- Status: **{:?}** (exit code {})\n",
        report.status, report.exit_code
    ));
    md.push_str(&format!(
        "- Steps: {}/{} recorded\n",
        report.steps.len(),
        report.total_steps
    ));
    md.push_str(&format!("- Remediations: {}\n", report.total_remediations()));
    md.push_str(&format!("- Duration: {}ms\n", report.duration_ms));

    md.push_str("\n## Steps\n\n| # | Step | Status | Attempts | Remediations |\n");
    md.push_str("|---|------|--------|----------|--------------|\n");
    for step in &report.steps {
        md.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            step.index,
            step.headline.replace('|', "\\|"),
            step.status.label(),
            step.attempts.len(),
            step.remediation_count
        ));
    }

    md.push_str("\n## Final Validation\n\n");
    match &report.final_validation {
        Some(v) if v.passed() => md.push_str("passed\n"),
        Some(v) => md.push_str(&format!("failed: {}\n", v.failed_checks().join(", "))),
        None => md.push_str("not run\n"),
    }
    md
}

/// Persist `<dir>/<run_id>/run_report.json` and `<dir>/<run_id>/summary.md`.
pub fn write_run_artifacts(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let run_dir = dir.join(&report.run_id);
    std::fs::create_dir_all(&run_dir)?;

    let json_path = run_dir.join("run_report.json");
    std::fs::write(&json_path, serde_json::to_vec_pretty(report)?)?;
    std::fs::write(run_dir.join("summary.md"), render_run_summary_md(report))?;
    Ok(json_path)
}

// ── export ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = StepwrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(StepwrightError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Serialise ledger records in the requested format.
pub fn export_records(records: &[MetricsRecord], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(records)?),
        ExportFormat::Csv => {
            let mut out = String::from(
                "run_id,subject,duration_ms,success,remediations,errors,warnings,timestamp\n",
            );
            for r in records {
                out.push_str(&format!(
                    "{},{},{},{},{},{},{},{}\n",
                    csv_field(&r.run_id),
                    csv_field(&r.subject.to_string()),
                    r.duration_ms,
                    r.success,
                    r.remediations,
                    r.errors,
                    r.warnings,
                    r.timestamp.to_rfc3339()
                ));
            }
            Ok(out)
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
