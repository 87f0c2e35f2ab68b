use std::fs;

use chrono::{NaiveDate, NaiveDateTime};
use fxpipe::{
    load_profile, load_target_series, lock_path_for, profile, run_pipeline, save_profile,
    DataProfileReport, DataQualityError, PipelineConfig, PipelineError, PipelinePaths,
    QualityCheck, ReconcileOutcome, Snapshot, StoreError, StoreLock,
};
use tempfile::tempdir;

fn at(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 11, 4)
        .and_then(|d| d.and_hms_opt(hour, 0, 0))
        .expect("valid fixture time")
}

fn payload(eur: f64) -> String {
    format!(
        r#"{{
            "base": "USD",
            "date": "2025-11-04",
            "time_last_updated": 1762214401,
            "rates": {{
                "USD": 1, "EUR": {eur}, "GBP": 0.76, "JPY": 153.2, "CAD": 1.41,
                "AUD": 1.53, "CHF": 0.81, "CNY": 7.12, "INR": 88.7, "MXN": 18.5,
                "SEK": 9.5, "NOK": 10.1
            }}
        }}"#
    )
}

fn paths_under(root: &std::path::Path) -> PipelinePaths {
    PipelinePaths {
        profile_path: root.join("models").join("training_stats.json"),
        ..PipelinePaths::under_root(root)
    }
}

#[test]
fn successive_runs_grow_the_store_and_feed_the_profiler() {
    let temp = tempdir().expect("tempdir");
    let paths = paths_under(temp.path());
    let cfg = PipelineConfig::default();

    let mut outcomes = Vec::new();
    for (hour, eur) in [(0, 0.91), (1, 0.92), (2, 0.93), (3, 0.95), (4, 0.94)] {
        let snapshot =
            Snapshot::from_api_payload(payload(eur).as_bytes(), at(hour)).expect("valid payload");
        let report = run_pipeline(&snapshot, &paths, &cfg).expect("run succeeds");
        assert!(report.quality.passed());
        assert_eq!(report.history_rows, hour as usize);
        outcomes.push(report.outcome);
    }
    assert_eq!(outcomes[0], ReconcileOutcome::Created);
    assert!(outcomes[1..].iter().all(|o| *o == ReconcileOutcome::Appended));

    let raw_dir = paths.raw_dir.as_ref().expect("raw dir configured");
    assert!(raw_dir.join("exchange_rates_raw_20251104_030000.csv").exists());

    let series = load_target_series(&paths.store_path, &cfg.target_series).expect("series loads");
    assert_eq!(series, vec![0.91, 0.92, 0.93, 0.95, 0.94]);

    let stats = profile(&series, cfg.n_lags).expect("enough rows");
    save_profile(&paths.profile_path, &stats).expect("profile saved");
    let loaded = load_profile(&paths.profile_path).expect("profile loads");
    let lag1 = loaded.feature("lag_1").expect("lag_1 profiled");
    assert_eq!(lag1.min, 0.93);
    assert_eq!(lag1.max, 0.95);
}

#[test]
fn failed_quality_gate_keeps_the_raw_snapshot_but_not_the_store() {
    let temp = tempdir().expect("tempdir");
    let paths = paths_under(temp.path());
    let cfg = PipelineConfig::default();

    let thin = r#"{"base": "USD", "date": "2025-11-04", "rates": {"EUR": 0.9, "GBP": 0.8}}"#;
    let snapshot = Snapshot::from_api_payload(thin.as_bytes(), at(5)).expect("valid payload");
    let err = run_pipeline(&snapshot, &paths, &cfg).expect_err("gate must stop the run");

    let raw_path = err.raw_path().expect("failed snapshot saved").to_path_buf();
    assert_eq!(
        raw_path,
        temp.path()
            .join("raw")
            .join("exchange_rates_raw_20251104_050000.csv")
    );
    assert!(raw_path.exists());
    match err {
        PipelineError::Quality { source, .. } => {
            assert_eq!(source.check(), Some(QualityCheck::SeriesCardinality));
            assert!(matches!(source, DataQualityError::InsufficientSeries { .. }));
        }
        other => panic!("expected quality failure, got {other:?}"),
    }
    assert!(!paths.store_path.exists());
    assert!(!temp.path().join("reports").exists());
}

#[test]
fn each_run_writes_a_data_profile_of_the_store() {
    let temp = tempdir().expect("tempdir");
    let paths = paths_under(temp.path());
    let cfg = PipelineConfig::default();

    let mut last = None;
    for (hour, eur) in [(0, 0.90), (1, 1.10)] {
        let snapshot =
            Snapshot::from_api_payload(payload(eur).as_bytes(), at(hour)).expect("valid payload");
        last = Some(run_pipeline(&snapshot, &paths, &cfg).expect("run succeeds"));
    }
    let run = last.expect("two runs");

    let report_path = run.report_path.expect("report written");
    assert_eq!(
        report_path,
        temp.path()
            .join("reports")
            .join("data_profile_20251104_010000.json")
    );
    let written: DataProfileReport =
        serde_json::from_slice(&fs::read(&report_path).expect("report readable"))
            .expect("report parses");

    assert_eq!(written.num_rows, 2);
    assert_eq!(written.num_columns, run.derived_columns);
    assert_eq!(written.quality.series_count, run.quality.series_count);
    assert!(written.quality.passed());

    let eur = written.column("EUR").expect("EUR profiled");
    assert_eq!((eur.count, eur.missing), (2, 0));
    let stats = eur.stats.expect("numeric column");
    assert_eq!((stats.min, stats.max), (0.90, 1.10));
    assert!((stats.mean - 1.0).abs() < 1e-12);

    let base = written.column("base_currency").expect("metadata profiled");
    assert_eq!(base.count, 2);
    assert!(base.stats.is_none());
}

#[test]
fn run_fails_visibly_while_another_writer_holds_the_store() {
    let temp = tempdir().expect("tempdir");
    let paths = paths_under(temp.path());
    let snapshot =
        Snapshot::from_api_payload(payload(0.9).as_bytes(), at(7)).expect("valid payload");

    let held = StoreLock::acquire(&paths.store_path).expect("first writer locks");
    let err = run_pipeline(&snapshot, &paths, &PipelineConfig::default())
        .expect_err("second writer must fail");
    assert!(matches!(err, PipelineError::Store(StoreError::Locked { .. })));
    assert!(!paths.store_path.exists());

    drop(held);
    assert!(lock_path_for(&paths.store_path).exists());
    let report = run_pipeline(&snapshot, &paths, &PipelineConfig::default())
        .expect("lock released");
    assert_eq!(report.outcome, ReconcileOutcome::Created);
}

#[test]
fn raw_snapshots_can_be_disabled() {
    let temp = tempdir().expect("tempdir");
    let paths = PipelinePaths {
        raw_dir: None,
        ..paths_under(temp.path())
    };
    let snapshot =
        Snapshot::from_api_payload(payload(0.9).as_bytes(), at(6)).expect("valid payload");

    let report = run_pipeline(&snapshot, &paths, &PipelineConfig::default()).expect("run succeeds");
    assert!(report.raw_path.is_none());
    assert!(paths.store_path.exists());
    assert!(fs::read_dir(temp.path())
        .expect("dir readable")
        .all(|entry| entry.expect("entry").file_name() != "raw"));
}
