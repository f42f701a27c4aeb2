//! Ledger behaviour shared by concurrent pipeline runs.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stepwright_core::{
    aggregate, export_records, AlertThresholds, ExportFormat, JsonlMetricsStore, MetricsRecorder,
    MetricsStore, Subject,
};

#[test]
fn concurrent_runs_never_interleave_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");

    let handles: Vec<_> = (0..4)
        .map(|n| {
            let path = path.clone();
            thread::spawn(move || {
                let recorder = MetricsRecorder::new(
                    format!("run-{n}"),
                    Arc::new(JsonlMetricsStore::new(path)),
                );
                for step in 1..=50 {
                    recorder.record(Subject::Step(step), Duration::from_millis(step as u64), true);
                }
                recorder.persistence_failures()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 0);
    }

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 200);
    for line in raw.lines() {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }

    let store = JsonlMetricsStore::new(&path);
    for n in 0..4 {
        assert_eq!(store.load_run(&format!("run-{n}")).unwrap().len(), 50);
    }
}

#[test]
fn unwritable_ledger_does_not_propagate() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the ledger file should be makes every append fail.
    let path = dir.path().join("ledger.jsonl");
    std::fs::create_dir_all(&path).unwrap();

    let recorder = MetricsRecorder::new("r1", Arc::new(JsonlMetricsStore::new(&path)));
    recorder.record(Subject::Step(1), Duration::from_millis(3), true);
    recorder.record(Subject::stage("test"), Duration::from_millis(3), false);
    assert_eq!(recorder.persistence_failures(), 2);
}

#[test]
fn ledger_feeds_report_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlMetricsStore::new(dir.path().join("ledger.jsonl")));
    let recorder = MetricsRecorder::new("r1", store.clone());
    recorder.record(Subject::Step(1), Duration::from_millis(10), true);
    recorder.record_with_remediations(Subject::Step(2), Duration::from_millis(30), true, 1);
    recorder.record(Subject::stage("analyze"), Duration::from_millis(5), true);

    let records = store.load().unwrap();
    let report = aggregate(&records, &AlertThresholds::default());
    let run = report.latest_run().unwrap();
    assert_eq!(run.steps, 2);
    assert_eq!(run.clean_steps, 1);
    assert_eq!(report.overall_health, 0.5);

    let csv = export_records(&records, ExportFormat::Csv).unwrap();
    assert_eq!(csv.lines().count(), 4);
    assert!(csv.contains("stage_analyze"));

    let json = export_records(&records, ExportFormat::Json).unwrap();
    let parsed: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.len(), 3);
}
