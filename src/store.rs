//! Historical store reconciliation: append, realign or rebuild.

use std::collections::HashSet;
use std::fs::{self, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::features::FeatureRow;
use crate::snapshot::COL_COLLECTION_DATETIME;
use crate::table::{
    append_rows, common_columns, probe_header, read_lenient, write_table, Table, TableError,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("store {path} is locked by another writer ({lock_path})")]
    Locked { path: PathBuf, lock_path: PathBuf },
    #[error("backup {backup} does not match store: expected sha256 {expected}, actual {actual}")]
    BackupVerificationFailed {
        backup: PathBuf,
        expected: String,
        actual: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshStartReason {
    /// The header could not be read.
    Unreadable,
    /// Too few columns in common with the new row.
    Incompatible,
    /// No row survived tolerant parsing.
    Empty,
}

impl FreshStartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreadable => "unreadable",
            Self::Incompatible => "incompatible",
            Self::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Created,
    Appended,
    Realigned {
        backup: PathBuf,
        rows: usize,
        dropped_columns: Vec<String>,
        skipped_lines: usize,
        dropped_rows: usize,
    },
    FreshStart {
        reason: FreshStartReason,
        backup: Option<PathBuf>,
    },
}

impl ReconcileOutcome {
    pub fn backup(&self) -> Option<&Path> {
        match self {
            Self::Realigned { backup, .. } => Some(backup),
            Self::FreshStart { backup, .. } => backup.as_deref(),
            Self::Created | Self::Appended => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Appended => "appended",
            Self::Realigned { .. } => "realigned",
            Self::FreshStart { .. } => "fresh_start",
        }
    }
}

/// Exclusive advisory lock on `<store>.lock`.
///
/// The OS drops the lock when its holder exits, so a lock file left by a
/// killed run does not block the next one.
#[derive(Debug)]
pub struct StoreLock {
    store_path: PathBuf,
    path: PathBuf,
    file: fs::File,
}

impl StoreLock {
    pub fn acquire(store_path: &Path) -> Result<Self, StoreError> {
        let lock_path = lock_path_for(store_path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(StoreError::Locked {
                    path: store_path.to_path_buf(),
                    lock_path,
                });
            }
            Err(TryLockError::Error(err)) => return Err(err.into()),
        }

        // Holder pid, for operators only.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self {
            store_path: store_path.to_path_buf(),
            path: lock_path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(
                component = "store",
                event = "store.lock.release_failed",
                lock_path = %self.path.display(),
                error = %err
            );
        }
    }
}

pub fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    store_path.with_file_name(name)
}

/// Reads the store for derivation. Missing or unreadable stores yield an
/// empty table; rows with an unparsable collection timestamp are dropped.
pub fn load_history(store_path: &Path) -> Table {
    if !store_path.exists() {
        return Table::default();
    }

    let parsed = match read_lenient(store_path) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                component = "store",
                event = "store.history.unreadable",
                path = %store_path.display(),
                error = %err
            );
            return Table::default();
        }
    };

    let mut table = parsed.table;
    let dropped_rows = table.retain_parsable_datetimes(COL_COLLECTION_DATETIME);
    if dropped_rows > 0 || !parsed.skipped.is_empty() {
        warn!(
            component = "store",
            event = "store.history.partial",
            path = %store_path.display(),
            skipped_lines = parsed.skipped.len(),
            dropped_rows,
            kept_rows = table.len()
        );
    }
    table
}

pub fn reconcile(
    store_path: &Path,
    row: &FeatureRow,
    cfg: &PipelineConfig,
) -> Result<ReconcileOutcome, StoreError> {
    reconcile_at(store_path, row, cfg, Utc::now().naive_utc())
}

/// Persists `row`, stamping any backup with `now`.
pub fn reconcile_at(
    store_path: &Path,
    row: &FeatureRow,
    cfg: &PipelineConfig,
    now: NaiveDateTime,
) -> Result<ReconcileOutcome, StoreError> {
    let lock = StoreLock::acquire(store_path)?;
    reconcile_locked(&lock, row, cfg, now)
}

/// Same as [`reconcile_at`] for a caller that already holds the store lock.
pub fn reconcile_locked(
    lock: &StoreLock,
    row: &FeatureRow,
    cfg: &PipelineConfig,
    now: NaiveDateTime,
) -> Result<ReconcileOutcome, StoreError> {
    let store_path = lock.store_path();
    let row_table = row.to_table()?;

    if !store_path.exists() {
        write_table(store_path, &row_table)?;
        info!(
            component = "store",
            event = "store.reconcile.create",
            path = %store_path.display(),
            columns = row.columns().len()
        );
        return Ok(ReconcileOutcome::Created);
    }

    let header = match probe_header(store_path) {
        Ok(header) => header,
        Err(err) => {
            let backup = backup_store(store_path, now)?;
            write_table(store_path, &row_table)?;
            warn!(
                component = "store",
                event = "store.reconcile.fresh_start",
                path = %store_path.display(),
                reason = FreshStartReason::Unreadable.as_str(),
                backup = %backup.display(),
                error = %err
            );
            return Ok(ReconcileOutcome::FreshStart {
                reason: FreshStartReason::Unreadable,
                backup: Some(backup),
            });
        }
    };

    if same_column_set(&header, row.columns()) {
        append_rows(store_path, &row_table, &header)?;
        info!(
            component = "store",
            event = "store.reconcile.append",
            path = %store_path.display(),
            columns = header.len()
        );
        return Ok(ReconcileOutcome::Appended);
    }

    let backup = backup_store(store_path, now)?;

    let common = common_columns(&header, row.columns());
    if common.len() <= cfg.min_common_columns {
        return fresh_start(store_path, &row_table, FreshStartReason::Incompatible, backup);
    }

    let parsed = match read_lenient(store_path) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                component = "store",
                event = "store.reconcile.parse_failed",
                path = %store_path.display(),
                error = %err
            );
            return fresh_start(store_path, &row_table, FreshStartReason::Unreadable, backup);
        }
    };
    let skipped_lines = parsed.skipped.len();
    let mut existing = parsed.table;
    let dropped_rows = existing.retain_parsable_datetimes(COL_COLLECTION_DATETIME);

    if existing.is_empty() {
        return fresh_start(store_path, &row_table, FreshStartReason::Empty, backup);
    }

    let kept: HashSet<&str> = common.iter().map(String::as_str).collect();
    let dropped_columns = dedup_preserving_order(
        existing
            .columns()
            .iter()
            .chain(row.columns().iter())
            .filter(|column| !kept.contains(column.as_str()))
            .cloned()
            .collect(),
    );

    let mut merged = existing.select(&common);
    merged.concat(&row_table);
    merged.sort_by_datetime(COL_COLLECTION_DATETIME);
    write_table(store_path, &merged)?;

    warn!(
        component = "store",
        event = "store.reconcile.realign",
        path = %store_path.display(),
        backup = %backup.display(),
        rows = merged.len(),
        common_columns = common.len(),
        dropped_columns = ?dropped_columns,
        skipped_lines,
        dropped_rows
    );

    Ok(ReconcileOutcome::Realigned {
        backup,
        rows: merged.len(),
        dropped_columns,
        skipped_lines,
        dropped_rows,
    })
}

fn fresh_start(
    store_path: &Path,
    row_table: &Table,
    reason: FreshStartReason,
    backup: PathBuf,
) -> Result<ReconcileOutcome, StoreError> {
    write_table(store_path, row_table)?;
    warn!(
        component = "store",
        event = "store.reconcile.fresh_start",
        path = %store_path.display(),
        reason = reason.as_str(),
        backup = %backup.display()
    );
    Ok(ReconcileOutcome::FreshStart {
        reason,
        backup: Some(backup),
    })
}

fn same_column_set(header: &[String], columns: &[String]) -> bool {
    if header.len() != columns.len() {
        return false;
    }
    let header: HashSet<&str> = header.iter().map(String::as_str).collect();
    header.len() == columns.len() && columns.iter().all(|column| header.contains(column.as_str()))
}

fn dedup_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

/// `<dir>/<stem>_backup_<YYYYmmdd_HHMMSS>.csv`, with `_N` appended on collision.
pub fn backup_path_for(store_path: &Path, now: NaiveDateTime) -> PathBuf {
    let stem = store_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    let stamp = now.format("%Y%m%d_%H%M%S");

    let base = store_path.with_file_name(format!("{stem}_backup_{stamp}.csv"));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| store_path.with_file_name(format!("{stem}_backup_{stamp}_{n}.csv")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(base)
}

/// Copies the store aside and verifies the copy's SHA-256 against the live file.
pub fn backup_store(store_path: &Path, now: NaiveDateTime) -> Result<PathBuf, StoreError> {
    let backup = backup_path_for(store_path, now);
    fs::copy(store_path, &backup)?;

    let expected = file_sha256_hex(store_path)?;
    let actual = file_sha256_hex(&backup)?;
    if expected != actual {
        return Err(StoreError::BackupVerificationFailed {
            backup,
            expected,
            actual,
        });
    }

    info!(
        component = "store",
        event = "store.reconcile.backup",
        path = %store_path.display(),
        backup = %backup.display(),
        sha256 = %expected
    );

    Ok(backup)
}

fn file_sha256_hex(path: &Path) -> Result<String, StoreError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}
