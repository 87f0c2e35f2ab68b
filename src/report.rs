//! Per-run data profile of the processed store.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::profile::FeatureStats;
use crate::quality::QualityReport;
use crate::table::{read_lenient, write_atomic, Cell, Table, TableError};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("report JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("table error: {0}")]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    /// Non-missing cells.
    pub count: usize,
    pub missing: usize,
    /// Present when every non-missing cell is a number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FeatureStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProfileReport {
    pub timestamp: String,
    pub store_path: PathBuf,
    pub num_rows: usize,
    pub num_columns: usize,
    pub quality: QualityReport,
    pub columns: Vec<ColumnSummary>,
}

impl DataProfileReport {
    pub fn column(&self, name: &str) -> Option<&ColumnSummary> {
        self.columns.iter().find(|column| column.name == name)
    }
}

pub fn summarize_columns(table: &Table) -> Vec<ColumnSummary> {
    table
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let cells: Vec<&Cell> = table.rows().iter().map(|row| &row[idx]).collect();
            let present: Vec<&Cell> = cells
                .iter()
                .copied()
                .filter(|cell| !cell.is_missing())
                .collect();
            let numbers: Vec<f64> = present.iter().filter_map(|cell| cell.as_f64()).collect();
            let stats = if numbers.len() == present.len() {
                FeatureStats::from_values(&numbers)
            } else {
                None
            };
            ColumnSummary {
                name: name.clone(),
                count: present.len(),
                missing: cells.len() - present.len(),
                stats,
            }
        })
        .collect()
}

/// Profiles the store as it stands after a run.
pub fn report(
    store_path: &Path,
    timestamp: &str,
    quality: &QualityReport,
) -> Result<DataProfileReport, ReportError> {
    let table = read_lenient(store_path)?.table;
    Ok(DataProfileReport {
        timestamp: timestamp.to_string(),
        store_path: store_path.to_path_buf(),
        num_rows: table.len(),
        num_columns: table.columns().len(),
        quality: quality.clone(),
        columns: summarize_columns(&table),
    })
}

/// Writes `data_profile_<stamp>.json` under `reports_dir`.
pub fn save_report(
    reports_dir: &Path,
    report: &DataProfileReport,
) -> Result<PathBuf, ReportError> {
    fs::create_dir_all(reports_dir).map_err(|source| ReportError::Io {
        path: reports_dir.to_path_buf(),
        source,
    })?;
    let path = reports_dir.join(format!("data_profile_{}.json", report.timestamp));
    let bytes = serde_json::to_vec_pretty(report)?;
    write_atomic(&path, &bytes)?;

    info!(
        component = "report",
        event = "report.saved",
        path = %path.display(),
        rows = report.num_rows,
        columns = report.num_columns
    );
    Ok(path)
}
