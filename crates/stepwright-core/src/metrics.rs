//! Append-only metrics ledger and run counters.
//!
//! Every step's terminal outcome and every gate stage run becomes one
//! [`MetricsRecord`]. Records are never updated or deleted; the reporter
//! only reads and aggregates them. Persistence failures are logged and
//! swallowed: metrics are observability, not correctness.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{Result, StepwrightError};

/// What a metrics record measures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Step(usize),
    Stage(String),
}

impl Subject {
    pub fn stage(name: impl Into<String>) -> Self {
        Subject::Stage(name.into())
    }

    pub fn is_step(&self) -> bool {
        matches!(self, Subject::Step(_))
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Step(n) => write!(f, "step_{n}"),
            Subject::Stage(name) => write!(f, "stage_{name}"),
        }
    }
}

/// One append-only metrics row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub run_id: String,
    pub subject: Subject,
    pub duration_ms: u64,
    pub success: bool,
    /// Remediation attempts spent on this subject.
    #[serde(default)]
    pub remediations: u32,
    /// `error` marker lines in the subject's output.
    #[serde(default)]
    pub errors: usize,
    /// `warning` marker lines in the subject's output.
    #[serde(default)]
    pub warnings: usize,
    pub timestamp: DateTime<Utc>,
}

impl MetricsRecord {
    /// Whether the record falls inside the last `days` days before `now`.
    pub fn within_days(&self, days: u32, now: DateTime<Utc>) -> bool {
        self.timestamp >= now - chrono::Duration::days(i64::from(days))
    }
}

/// Storage backend for metrics records.
pub trait MetricsStore: Send + Sync {
    /// Append a record. Must be safe under concurrent appenders.
    fn append(&self, record: &MetricsRecord) -> Result<()>;

    /// Load every record in append order.
    fn load(&self) -> Result<Vec<MetricsRecord>>;

    /// Load the records of one run.
    fn load_run(&self, run_id: &str) -> Result<Vec<MetricsRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.run_id == run_id)
            .collect())
    }
}

/// Newline-delimited JSON ledger.
///
/// Each record is serialised to one line and written with a single
/// `write_all` on a file opened in append mode, so rows from concurrent
/// runs sharing the ledger never interleave.
pub struct JsonlMetricsStore {
    path: PathBuf,
}

impl JsonlMetricsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsStore for JsonlMetricsStore {
    fn append(&self, record: &MetricsRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<MetricsRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MetricsRecord>(&line) {
                Ok(record) => records.push(record),
                // A torn trailing row from a crashed writer must not hide the rest.
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable metrics row"
                ),
            }
        }
        Ok(records)
    }
}

/// In-process store used by tests and dry runs.
#[derive(Default)]
pub struct MemoryMetricsStore {
    records: Mutex<Vec<MetricsRecord>>,
    fail_writes: bool,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose appends always fail.
    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_writes: true,
        }
    }
}

impl MetricsStore for MemoryMetricsStore {
    fn append(&self, record: &MetricsRecord) -> Result<()> {
        if self.fail_writes {
            return Err(StepwrightError::Persistence(
                "metrics store rejected write".to_string(),
            ));
        }
        self.records
            .lock()
            .map_err(|_| StepwrightError::Persistence("metrics store poisoned".to_string()))?
            .push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<MetricsRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| StepwrightError::Persistence("metrics store poisoned".to_string()))?
            .clone())
    }
}

/// Run-scoped facade over a store.
///
/// Tags every record with the run id and never propagates a write failure.
#[derive(Clone)]
pub struct MetricsRecorder {
    run_id: String,
    store: Option<Arc<dyn MetricsStore>>,
    persistence_failures: Arc<AtomicU64>,
}

impl MetricsRecorder {
    pub fn new(run_id: impl Into<String>, store: Arc<dyn MetricsStore>) -> Self {
        Self {
            run_id: run_id.into(),
            store: Some(store),
            persistence_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Recorder that drops everything (monitoring disabled).
    pub fn disabled(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            store: None,
            persistence_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn record(&self, subject: Subject, duration: Duration, success: bool) {
        self.record_with_remediations(subject, duration, success, 0);
    }

    pub fn record_with_remediations(
        &self,
        subject: Subject,
        duration: Duration,
        success: bool,
        remediations: u32,
    ) {
        let record = self.build(subject, duration, success);
        self.append(MetricsRecord {
            remediations,
            ..record
        });
    }

    /// Record a stage run with the error and warning markers found in its output.
    pub fn record_with_markers(
        &self,
        subject: Subject,
        duration: Duration,
        success: bool,
        errors: usize,
        warnings: usize,
    ) {
        let record = self.build(subject, duration, success);
        self.append(MetricsRecord {
            errors,
            warnings,
            ..record
        });
    }

    fn build(&self, subject: Subject, duration: Duration, success: bool) -> MetricsRecord {
        MetricsRecord {
            run_id: self.run_id.clone(),
            subject,
            duration_ms: duration.as_millis() as u64,
            success,
            remediations: 0,
            errors: 0,
            warnings: 0,
            timestamp: Utc::now(),
        }
    }

    fn append(&self, record: MetricsRecord) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.append(&record) {
            self.persistence_failures.fetch_add(1, Ordering::Relaxed);
            crate::obs::emit_persistence_error(&self.run_id, &record.subject, &e);
        }
    }

    /// Persistence failures swallowed so far.
    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }
}

/// Atomic counters for one run, flushed as a single `info!` event.
#[derive(Debug, Default)]
pub struct RunCounters {
    steps_completed: AtomicU64,
    attempts: AtomicU64,
    timeouts: AtomicU64,
    remediations: AtomicU64,
    structural_repairs: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_steps(&self) {
        self.steps_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_attempts(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_remediations(&self) {
        self.remediations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_repairs(&self) {
        self.structural_repairs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn steps_completed(&self) -> u64 {
        self.steps_completed.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn remediations(&self) -> u64 {
        self.remediations.load(Ordering::Relaxed)
    }

    pub fn structural_repairs(&self) -> u64 {
        self.structural_repairs.load(Ordering::Relaxed)
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self, run_id: &str) {
        tracing::info!(
            metric = "flush",
            run_id = %run_id,
            steps_completed = self.steps_completed(),
            attempts = self.attempts(),
            timeouts = self.timeouts(),
            remediations = self.remediations(),
            structural_repairs = self.structural_repairs(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(run: &str, subject: Subject, success: bool) -> MetricsRecord {
        MetricsRecord {
            run_id: run.to_string(),
            subject,
            duration_ms: 10,
            success,
            remediations: 0,
            errors: 0,
            warnings: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_jsonl_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMetricsStore::new(dir.path().join("metrics").join("ledger.jsonl"));
        store.append(&sample("r1", Subject::Step(1), true)).unwrap();
        store.append(&sample("r1", Subject::stage("test"), false)).unwrap();
        store.append(&sample("r2", Subject::Step(1), true)).unwrap();

        let all = store.load().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].subject, Subject::Stage("test".to_string()));
        assert_eq!(store.load_run("r1").unwrap().len(), 2);
    }

    #[test]
    fn test_jsonl_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMetricsStore::new(dir.path().join("none.jsonl"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_jsonl_skips_torn_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let store = JsonlMetricsStore::new(&path);
        store.append(&sample("r1", Subject::Step(1), true)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"run_id\":\"r1\",\"subj").unwrap();

        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_recorder_swallows_failures() {
        let recorder = MetricsRecorder::new("r1", Arc::new(MemoryMetricsStore::failing()));
        recorder.record(Subject::Step(1), Duration::from_millis(5), true);
        recorder.record(Subject::Step(2), Duration::from_millis(5), false);
        assert_eq!(recorder.persistence_failures(), 2);
    }

    #[test]
    fn test_recorder_keeps_marker_counts() {
        let store = Arc::new(MemoryMetricsStore::new());
        let recorder = MetricsRecorder::new("r1", store.clone());
        recorder.record_with_markers(
            Subject::stage("analyze"),
            Duration::from_millis(5),
            false,
            3,
            7,
        );

        let records = store.load().unwrap();
        assert_eq!(records[0].errors, 3);
        assert_eq!(records[0].warnings, 7);
        assert_eq!(records[0].remediations, 0);
    }

    #[test]
    fn test_rows_without_marker_counts_still_load() {
        let row = concat!(
            r#"{"run_id":"r1","subject":{"kind":"step","id":1},"#,
            r#""duration_ms":4,"success":true,"timestamp":"2026-01-01T00:00:00Z"}"#
        );
        let record: MetricsRecord = serde_json::from_str(row).unwrap();
        assert_eq!(record.errors, 0);
        assert_eq!(record.warnings, 0);
    }

    #[test]
    fn test_within_days() {
        let now = Utc::now();
        let mut record = sample("r1", Subject::Step(1), true);
        record.timestamp = now - chrono::Duration::days(31);
        assert!(!record.within_days(30, now));
        record.timestamp = now - chrono::Duration::days(29);
        assert!(record.within_days(30, now));
    }

    #[test]
    fn test_disabled_recorder_records_nothing() {
        let recorder = MetricsRecorder::disabled("r1");
        recorder.record(Subject::Step(1), Duration::from_millis(5), true);
        assert!(!recorder.is_enabled());
        assert_eq!(recorder.persistence_failures(), 0);
    }

    #[test]
    fn test_counters() {
        let counters = RunCounters::new();
        counters.inc_attempts();
        counters.inc_attempts();
        counters.inc_timeouts();
        assert_eq!(counters.attempts(), 2);
        assert_eq!(counters.timeouts(), 1);
        assert_eq!(counters.remediations(), 0);
    }

    #[test]
    fn test_subject_display() {
        assert_eq!(Subject::Step(3).to_string(), "step_3");
        assert_eq!(Subject::stage("build").to_string(), "stage_build");
    }
}
