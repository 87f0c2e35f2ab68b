use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use fxpipe::{
    derive, load_history, lock_path_for, parse_datetime_cell, read_lenient, reconcile,
    reconcile_at, FreshStartReason, PipelineConfig, ReconcileOutcome, Snapshot, StoreError,
    StoreLock, Table,
};
use regex::Regex;
use tempfile::tempdir;

const SERIES: [&str; 8] = ["EUR", "GBP", "JPY", "CAD", "AUD", "CHF", "SEK", "NOK"];

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 11, day)
        .and_then(|d| d.and_hms_opt(hour, 0, 0))
        .expect("valid fixture time")
}

fn snapshot_with(collected_at: NaiveDateTime, series: &[&str]) -> Snapshot {
    Snapshot::from_numeric_rates(
        collected_at,
        series
            .iter()
            .enumerate()
            .map(|(i, code)| (*code, 0.5 + i as f64 + collected_at.hour() as f64 * 0.01)),
    )
}

/// Same flow as a pipeline run, minus the quality gate.
fn ingest(store: &Path, snap: &Snapshot, cfg: &PipelineConfig) -> ReconcileOutcome {
    let history = load_history(store);
    let row = derive(snap, &history, cfg).expect("derive succeeds");
    reconcile(store, &row, cfg).expect("reconcile succeeds")
}

fn backups_in(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)
        .expect("dir readable")
        .map(|entry| entry.expect("dir entry").path())
        .filter(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().contains("_backup_"))
                .unwrap_or(false)
        })
        .collect();
    found.sort();
    found
}

fn stored_rows(store: &Path) -> Table {
    read_lenient(store).expect("store readable").table
}

fn collection_times(table: &Table) -> Vec<NaiveDateTime> {
    let idx = table
        .column_index("collection_datetime")
        .expect("collection_datetime column");
    table
        .rows()
        .iter()
        .map(|row| parse_datetime_cell(&row[idx]).expect("parsable timestamp"))
        .collect()
}

#[test]
fn first_reconcile_creates_store_that_reads_back_identically() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("processed").join("exchange_rates.csv");
    let cfg = PipelineConfig::default();

    let row = derive(&snapshot_with(at(3, 9), &SERIES), &Table::default(), &cfg)
        .expect("derive succeeds");
    let outcome = reconcile(&store, &row, &cfg).expect("reconcile succeeds");
    assert_eq!(outcome, ReconcileOutcome::Created);

    let table = stored_rows(&store);
    assert_eq!(table.columns(), row.columns());
    assert_eq!(table.len(), 1);
    assert_eq!(table.rows()[0], row.values());
    assert!(StoreLock::acquire(&store).is_ok());
}

#[test]
fn same_schema_runs_append_without_backups() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();

    let outcomes: Vec<ReconcileOutcome> = (0..5)
        .map(|h| ingest(&store, &snapshot_with(at(3, h), &SERIES), &cfg))
        .collect();

    assert_eq!(outcomes[0], ReconcileOutcome::Created);
    assert!(outcomes[1..]
        .iter()
        .all(|outcome| *outcome == ReconcileOutcome::Appended));
    assert_eq!(stored_rows(&store).len(), 5);
    assert!(backups_in(temp.path()).is_empty());

    let header = fs::read_to_string(&store).expect("store readable");
    assert_eq!(header.matches("collection_datetime").count(), 1);
}

#[test]
fn schema_drift_realigns_keeps_every_timestamp_and_backs_up() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();

    for h in [0, 2, 4, 6] {
        ingest(&store, &snapshot_with(at(3, h), &SERIES), &cfg);
    }
    let before = stored_rows(&store).len();

    // A late snapshot carrying a series the store has never seen.
    let mut wider = SERIES.to_vec();
    wider.push("NZD");
    let row = derive(&snapshot_with(at(3, 3), &wider), &Table::default(), &cfg)
        .expect("derive succeeds");
    let outcome = reconcile_at(&store, &row, &cfg, at(4, 12)).expect("reconcile succeeds");

    let backup = match &outcome {
        ReconcileOutcome::Realigned {
            backup,
            rows,
            dropped_columns,
            ..
        } => {
            assert_eq!(*rows, before + 1);
            assert_eq!(dropped_columns, &vec!["NZD".to_string()]);
            backup.clone()
        }
        other => panic!("expected realign, got {other:?}"),
    };

    let merged = stored_rows(&store);
    assert_eq!(merged.len(), before + 1);
    assert!(!merged.has_column("NZD"));
    assert_eq!(
        collection_times(&merged),
        vec![at(3, 0), at(3, 2), at(3, 3), at(3, 4), at(3, 6)]
    );

    assert_eq!(stored_rows(&backup).len(), before);
    let name_re = Regex::new(r"^exchange_rates_backup_\d{8}_\d{6}(_\d+)?\.csv$").expect("regex");
    let name = backup
        .file_name()
        .expect("backup file name")
        .to_string_lossy()
        .to_string();
    assert!(name_re.is_match(&name), "{name}");
    assert_eq!(name, "exchange_rates_backup_20251104_120000.csv");
}

#[test]
fn dropped_series_in_a_later_snapshot_triggers_realign() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();

    ingest(&store, &snapshot_with(at(3, 0), &SERIES), &cfg);
    ingest(&store, &snapshot_with(at(3, 1), &SERIES), &cfg);
    let outcome = ingest(&store, &snapshot_with(at(3, 2), &SERIES[..7]), &cfg);

    assert!(matches!(outcome, ReconcileOutcome::Realigned { rows: 3, .. }));
    let merged = stored_rows(&store);
    assert!(!merged.has_column("NOK"));
    assert!(merged.has_column("EUR_lag1"));
    assert_eq!(backups_in(temp.path()).len(), 1);
}

#[test]
fn incompatible_store_is_backed_up_and_replaced() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();
    let legacy = "foo,bar,baz\n1,2,3\n4,5,6\n";
    fs::write(&store, legacy).expect("seed store");

    let outcome = ingest(&store, &snapshot_with(at(3, 9), &SERIES), &cfg);
    let ReconcileOutcome::FreshStart { reason, backup } = outcome else {
        panic!("expected fresh start");
    };
    assert_eq!(reason, FreshStartReason::Incompatible);

    let backup = backup.expect("backup path");
    assert_eq!(fs::read_to_string(&backup).expect("backup readable"), legacy);
    assert_eq!(stored_rows(&store).len(), 1);
}

#[test]
fn store_with_no_parsable_rows_starts_fresh() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();
    fs::write(
        &store,
        "timestamp,collection_datetime,base_currency,api_date,EUR,GBP,JPY\n\
         x,not-a-time,USD,2025-11-01,0.9,0.8,150\n",
    )
    .expect("seed store");

    let outcome = ingest(&store, &snapshot_with(at(3, 9), &SERIES), &cfg);
    assert!(matches!(
        outcome,
        ReconcileOutcome::FreshStart {
            reason: FreshStartReason::Empty,
            backup: Some(_)
        }
    ));
    assert_eq!(stored_rows(&store).len(), 1);
}

#[test]
fn empty_store_file_is_treated_as_unreadable() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();
    fs::write(&store, "").expect("seed store");

    let outcome = ingest(&store, &snapshot_with(at(3, 9), &SERIES), &cfg);
    assert!(matches!(
        outcome,
        ReconcileOutcome::FreshStart {
            reason: FreshStartReason::Unreadable,
            ..
        }
    ));
    assert_eq!(backups_in(temp.path()).len(), 1);
    assert_eq!(stored_rows(&store).len(), 1);
}

#[test]
fn malformed_lines_are_skipped_during_realign() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();

    ingest(&store, &snapshot_with(at(3, 0), &SERIES), &cfg);
    ingest(&store, &snapshot_with(at(3, 1), &SERIES), &cfg);
    let mut raw = fs::read_to_string(&store).expect("store readable");
    raw.push_str("garbage,with,far,too,many,fields");
    raw.push_str(&",x".repeat(80));
    raw.push('\n');
    fs::write(&store, raw).expect("corrupt store");

    let outcome = ingest(&store, &snapshot_with(at(3, 2), &SERIES[..7]), &cfg);
    match outcome {
        ReconcileOutcome::Realigned {
            rows,
            skipped_lines,
            ..
        } => {
            assert_eq!(rows, 3);
            assert_eq!(skipped_lines, 1);
        }
        other => panic!("expected realign, got {other:?}"),
    }
}

#[test]
fn held_lock_rejects_a_second_writer() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();
    let row = derive(&snapshot_with(at(3, 9), &SERIES), &Table::default(), &cfg)
        .expect("derive succeeds");

    let lock = StoreLock::acquire(&store).expect("first writer locks");
    let err = reconcile(&store, &row, &cfg).expect_err("second writer must fail");
    assert!(matches!(err, StoreError::Locked { .. }));
    assert!(!store.exists());

    drop(lock);
    assert_eq!(
        reconcile(&store, &row, &cfg).expect("lock released"),
        ReconcileOutcome::Created
    );
}

#[test]
fn lock_file_left_by_a_killed_run_does_not_block_writers() {
    let temp = tempdir().expect("tempdir");
    let store = temp.path().join("exchange_rates.csv");
    let cfg = PipelineConfig::default();
    fs::write(lock_path_for(&store), "999999\n").expect("stale lock written");

    for hour in 0..3 {
        let outcome = ingest(&store, &snapshot_with(at(3, hour), &SERIES), &cfg);
        let expected = if hour == 0 {
            ReconcileOutcome::Created
        } else {
            ReconcileOutcome::Appended
        };
        assert_eq!(outcome, expected);
    }
    assert_eq!(stored_rows(&store).len(), 3);
}
