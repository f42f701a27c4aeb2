//! Verification gate and step validation results.

use serde::{Deserialize, Serialize};

/// Default number of trailing diagnostic lines kept per check.
pub const DEFAULT_TAIL_LINES: usize = 200;

/// Outcome of a single gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    NotRun,
    Passed,
    FailedWithErrors,
    FailedWithWarningsOnly,
}

impl CheckStatus {
    /// Whether this status blocks the gate.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CheckStatus::FailedWithErrors | CheckStatus::FailedWithWarningsOnly
        )
    }
}

/// A single check's classified result and bounded diagnostic tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub exit_code: Option<i32>,
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Last lines of combined output.
    pub tail: String,
}

impl CheckResult {
    pub fn not_run() -> Self {
        Self {
            status: CheckStatus::NotRun,
            exit_code: None,
            errors: 0,
            warnings: 0,
            infos: 0,
            timed_out: false,
            duration_ms: 0,
            tail: String::new(),
        }
    }

    pub fn passed(&self) -> bool {
        !self.status.is_failure()
    }
}

impl Default for CheckResult {
    fn default() -> Self {
        Self::not_run()
    }
}

/// Fresh result of one gate invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub resolve: CheckResult,
    pub analyze: CheckResult,
    pub test: CheckResult,
    pub build: CheckResult,
}

impl VerificationResult {
    /// Whether no check failed.
    pub fn passed(&self) -> bool {
        self.resolve.passed() && self.analyze.passed() && self.test.passed() && self.build.passed()
    }

    /// Names of the failing checks, in gate order.
    pub fn failed_checks(&self) -> Vec<&'static str> {
        self.named()
            .into_iter()
            .filter(|(_, c)| c.status.is_failure())
            .map(|(name, _)| name)
            .collect()
    }

    /// Diagnostic context for the remediation agent: one section per failing check.
    pub fn diagnostics(&self) -> String {
        let mut out = String::new();
        for (name, check) in self.named() {
            if !check.status.is_failure() {
                continue;
            }
            out.push_str(&format!("[{name}]\n"));
            out.push_str(check.tail.trim_end());
            out.push_str("\n\n");
        }
        out
    }

    fn named(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("resolve", &self.resolve),
            ("analyze", &self.analyze),
            ("tests", &self.test),
            ("build", &self.build),
        ]
    }
}

/// Result of a single acceptance criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    pub detail: String,
}

/// Result of a step validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub validator: String,
    pub passed: bool,
    pub results: Vec<CriterionResult>,
}

impl ValidationReport {
    pub fn pass(validator: impl Into<String>) -> Self {
        Self {
            validator: validator.into(),
            passed: true,
            results: Vec::new(),
        }
    }

    pub fn from_results(validator: impl Into<String>, results: Vec<CriterionResult>) -> Self {
        let passed = results.iter().all(|r| r.passed);
        Self {
            validator: validator.into(),
            passed,
            results,
        }
    }

    pub fn failures(&self) -> Vec<&CriterionResult> {
        self.results.iter().filter(|r| !r.passed).collect()
    }

    /// Diagnostic context describing the failed criteria.
    pub fn diagnostics(&self) -> String {
        let mut out = String::from("[validation]\n");
        for failure in self.failures() {
            out.push_str(&format!("- {}: {}\n", failure.criterion, failure.detail));
        }
        out
    }
}

/// Keep only the last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(status: CheckStatus, tail: &str) -> CheckResult {
        CheckResult {
            status,
            tail: tail.to_string(),
            ..CheckResult::not_run()
        }
    }

    #[test]
    fn test_not_run_counts_as_passing() {
        let result = VerificationResult::default();
        assert!(result.passed());
        assert!(result.failed_checks().is_empty());
    }

    #[test]
    fn test_warnings_only_blocks() {
        let result = VerificationResult {
            analyze: failed(CheckStatus::FailedWithWarningsOnly, "warning: x"),
            ..Default::default()
        };
        assert!(!result.passed());
        assert_eq!(result.failed_checks(), vec!["analyze"]);
    }

    #[test]
    fn test_diagnostics_sections() {
        let result = VerificationResult {
            analyze: failed(CheckStatus::FailedWithErrors, "error: boom"),
            test: failed(CheckStatus::FailedWithErrors, "1 test failed"),
            ..Default::default()
        };
        let diag = result.diagnostics();
        assert!(diag.contains("[analyze]\nerror: boom"));
        assert!(diag.contains("[tests]\n1 test failed"));
        assert!(!diag.contains("[build]"));
    }

    #[test]
    fn test_tail_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), text);
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn test_validation_report_failures() {
        let report = ValidationReport::from_results(
            "criteria",
            vec![
                CriterionResult {
                    criterion: "file_exists(a)".into(),
                    passed: true,
                    detail: "found".into(),
                },
                CriterionResult {
                    criterion: "file_exists(b)".into(),
                    passed: false,
                    detail: "missing".into(),
                },
            ],
        );
        assert!(!report.passed);
        assert_eq!(report.failures().len(), 1);
        assert!(report.diagnostics().contains("file_exists(b): missing"));
    }
}
