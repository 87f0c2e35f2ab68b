//! One ingestion run: save raw, gate, derive, persist, profile.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{PipelineConfig, PipelinePaths};
use crate::features::{derive, FeatureError};
use crate::quality::{validate, DataQualityError, QualityReport};
use crate::report::{report, save_report, ReportError};
use crate::snapshot::{Snapshot, SnapshotError};
use crate::store::{load_history, reconcile_locked, ReconcileOutcome, StoreError, StoreLock};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// `raw_path` is the saved snapshot that failed, when raw output is on.
    #[error("quality gate failed: {source}")]
    Quality {
        source: DataQualityError,
        raw_path: Option<PathBuf>,
    },
    #[error("raw snapshot could not be saved: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("feature derivation failed: {0}")]
    Features(#[from] FeatureError),
    #[error("store reconcile failed: {0}")]
    Store(#[from] StoreError),
    #[error("data profile report failed: {0}")]
    Report(#[from] ReportError),
}

impl PipelineError {
    pub fn raw_path(&self) -> Option<&Path> {
        match self {
            Self::Quality { raw_path, .. } => raw_path.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRunReport {
    pub timestamp: String,
    pub quality: QualityReport,
    pub raw_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub history_rows: usize,
    pub derived_columns: usize,
    pub outcome: ReconcileOutcome,
}

pub fn run_pipeline(
    snapshot: &Snapshot,
    paths: &PipelinePaths,
    cfg: &PipelineConfig,
) -> Result<PipelineRunReport, PipelineError> {
    info!(
        component = "pipeline",
        event = "pipeline.run.start",
        timestamp = %snapshot.timestamp,
        series = snapshot.series_count(),
        store = %paths.store_path.display()
    );

    let result = run_steps(snapshot, paths, cfg);
    match &result {
        Ok(report) => info!(
            component = "pipeline",
            event = "pipeline.run.finish",
            timestamp = %report.timestamp,
            outcome = report.outcome.label(),
            history_rows = report.history_rows,
            derived_columns = report.derived_columns
        ),
        Err(err) => error!(
            component = "pipeline",
            event = "pipeline.run.error",
            timestamp = %snapshot.timestamp,
            error = %err
        ),
    }
    result
}

fn run_steps(
    snapshot: &Snapshot,
    paths: &PipelinePaths,
    cfg: &PipelineConfig,
) -> Result<PipelineRunReport, PipelineError> {
    let raw_path = match &paths.raw_dir {
        Some(dir) => Some(snapshot.write_raw(dir)?),
        None => None,
    };

    let quality = validate(snapshot, cfg).map_err(|source| PipelineError::Quality {
        source,
        raw_path: raw_path.clone(),
    })?;

    // Held from history load through the write so lags see the latest store.
    let lock = StoreLock::acquire(&paths.store_path)?;
    let history = load_history(&paths.store_path);
    let row = derive(snapshot, &history, cfg)?;
    let outcome = reconcile_locked(&lock, &row, cfg, Utc::now().naive_utc())?;

    let report_path = match &paths.reports_dir {
        Some(dir) => {
            let profile = report(&paths.store_path, &snapshot.timestamp, &quality)?;
            Some(save_report(dir, &profile)?)
        }
        None => None,
    };
    drop(lock);

    Ok(PipelineRunReport {
        timestamp: snapshot.timestamp.clone(),
        quality,
        raw_path,
        report_path,
        history_rows: history.len(),
        derived_columns: row.columns().len(),
        outcome,
    })
}
