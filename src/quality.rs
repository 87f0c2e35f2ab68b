//! Snapshot quality gate.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::snapshot::{Snapshot, METADATA_COLUMNS, REQUIRED_COLUMNS};
use crate::table::{Table, TableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityCheck {
    NullRatio,
    RequiredColumns,
    SeriesCardinality,
    TypeConformance,
}

impl QualityCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NullRatio => "null_ratio",
            Self::RequiredColumns => "required_columns",
            Self::SeriesCardinality => "series_cardinality",
            Self::TypeConformance => "type_conformance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: QualityCheck,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub null_ratio: f64,
    pub null_threshold: f64,
    pub missing_required_columns: Vec<String>,
    pub series_count: usize,
    pub min_series: usize,
    pub non_numeric_columns: Vec<String>,
    pub num_rows: usize,
    pub num_columns: usize,
    pub checks: Vec<CheckOutcome>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|outcome| outcome.passed)
    }

    pub fn failed_checks(&self) -> Vec<QualityCheck> {
        self.checks
            .iter()
            .filter(|outcome| !outcome.passed)
            .map(|outcome| outcome.check)
            .collect()
    }

    pub fn check_passed(&self, check: QualityCheck) -> bool {
        self.checks
            .iter()
            .any(|outcome| outcome.check == check && outcome.passed)
    }
}

#[derive(Debug, Error)]
pub enum DataQualityError {
    #[error("null ratio {:.4} exceeds threshold {:.4}", .report.null_ratio, .report.null_threshold)]
    NullRatioExceeded { report: Box<QualityReport> },
    #[error("missing required columns: {:?}", .report.missing_required_columns)]
    MissingRequiredColumns { report: Box<QualityReport> },
    #[error(
        "only {} series present, minimum {} required",
        .report.series_count,
        .report.min_series
    )]
    InsufficientSeries { report: Box<QualityReport> },
    #[error("series columns are not numeric: {:?}", .report.non_numeric_columns)]
    NonNumericSeries { report: Box<QualityReport> },
    #[error("snapshot could not be tabulated: {0}")]
    Table(#[from] TableError),
}

impl DataQualityError {
    pub fn report(&self) -> Option<&QualityReport> {
        match self {
            Self::NullRatioExceeded { report }
            | Self::MissingRequiredColumns { report }
            | Self::InsufficientSeries { report }
            | Self::NonNumericSeries { report } => Some(report),
            Self::Table(_) => None,
        }
    }

    pub fn check(&self) -> Option<QualityCheck> {
        match self {
            Self::NullRatioExceeded { .. } => Some(QualityCheck::NullRatio),
            Self::MissingRequiredColumns { .. } => Some(QualityCheck::RequiredColumns),
            Self::InsufficientSeries { .. } => Some(QualityCheck::SeriesCardinality),
            Self::NonNumericSeries { .. } => Some(QualityCheck::TypeConformance),
            Self::Table(_) => None,
        }
    }
}

pub fn validate(
    snapshot: &Snapshot,
    cfg: &PipelineConfig,
) -> Result<QualityReport, DataQualityError> {
    validate_table(&snapshot.to_table()?, cfg)
}

/// Runs every check, logs the report, then fails on the first failed check.
pub fn validate_table(
    table: &Table,
    cfg: &PipelineConfig,
) -> Result<QualityReport, DataQualityError> {
    let report = build_report(table, cfg);
    log_report(&report);

    let failed = report.failed_checks();
    let Some(first) = failed.first() else {
        return Ok(report);
    };

    let report = Box::new(report);
    Err(match first {
        QualityCheck::NullRatio => DataQualityError::NullRatioExceeded { report },
        QualityCheck::RequiredColumns => DataQualityError::MissingRequiredColumns { report },
        QualityCheck::SeriesCardinality => DataQualityError::InsufficientSeries { report },
        QualityCheck::TypeConformance => DataQualityError::NonNumericSeries { report },
    })
}

fn build_report(table: &Table, cfg: &PipelineConfig) -> QualityReport {
    let num_rows = table.len();
    let num_columns = table.columns().len();
    let total_cells = num_rows * num_columns;
    let null_ratio = if total_cells == 0 {
        0.0
    } else {
        table.missing_cells() as f64 / total_cells as f64
    };

    let missing_required_columns: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|column| !table.has_column(column))
        .map(|column| (*column).to_string())
        .collect();

    let required: HashSet<&str> = REQUIRED_COLUMNS.iter().copied().collect();
    let series_count = table
        .columns()
        .iter()
        .filter(|column| !required.contains(column.as_str()))
        .count();

    let metadata: HashSet<&str> = METADATA_COLUMNS.iter().copied().collect();
    let non_numeric_columns: Vec<String> = table
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, column)| !metadata.contains(column.as_str()))
        .take(cfg.type_sample_size)
        .filter(|(idx, _)| {
            table
                .rows()
                .iter()
                .any(|row| !row[*idx].is_missing() && row[*idx].as_f64().is_none())
        })
        .map(|(_, column)| column.clone())
        .collect();

    let checks = vec![
        CheckOutcome {
            check: QualityCheck::NullRatio,
            passed: null_ratio <= cfg.null_threshold,
        },
        CheckOutcome {
            check: QualityCheck::RequiredColumns,
            passed: missing_required_columns.is_empty(),
        },
        CheckOutcome {
            check: QualityCheck::SeriesCardinality,
            passed: series_count >= cfg.min_currencies,
        },
        CheckOutcome {
            check: QualityCheck::TypeConformance,
            passed: non_numeric_columns.is_empty(),
        },
    ];

    QualityReport {
        null_ratio,
        null_threshold: cfg.null_threshold,
        missing_required_columns,
        series_count,
        min_series: cfg.min_currencies,
        non_numeric_columns,
        num_rows,
        num_columns,
        checks,
    }
}

fn log_report(report: &QualityReport) {
    let failed: Vec<&'static str> = report
        .failed_checks()
        .into_iter()
        .map(QualityCheck::as_str)
        .collect();

    if failed.is_empty() {
        info!(
            component = "quality",
            event = "quality.report",
            passed = true,
            null_ratio = report.null_ratio,
            series_count = report.series_count,
            num_rows = report.num_rows,
            num_columns = report.num_columns
        );
    } else {
        warn!(
            component = "quality",
            event = "quality.report",
            passed = false,
            failed_checks = ?failed,
            null_ratio = report.null_ratio,
            null_threshold = report.null_threshold,
            missing_required_columns = ?report.missing_required_columns,
            series_count = report.series_count,
            min_series = report.min_series,
            non_numeric_columns = ?report.non_numeric_columns
        );
    }
}
