//! Calendar, lag, rolling and rate-of-change feature derivation.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::snapshot::{Snapshot, COL_COLLECTION_DATETIME, METADATA_COLUMNS};
use crate::table::{common_columns, Cell, Table, TableError};

pub const CALENDAR_COLUMNS: [&str; 6] = [
    "day_of_week",
    "day_of_month",
    "month",
    "quarter",
    "year",
    "hour",
];

const DERIVED_MARKERS: [&str; 3] = ["_lag", "_rolling", "_pct_change"];

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("table error: {0}")]
    Table(#[from] TableError),
}

/// One derived store row. Columns and values are index-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    columns: Vec<String>,
    values: Vec<Cell>,
}

impl FeatureRow {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|idx| &self.values[idx])
    }

    pub fn to_table(&self) -> Result<Table, TableError> {
        let mut table = Table::new(self.columns.clone())?;
        table.push_row(self.values.clone())?;
        Ok(table)
    }

    fn push(&mut self, column: String, value: Cell) {
        self.columns.push(column);
        self.values.push(value);
    }
}

/// Per-row features of one series, aligned with the config's offsets and windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesFeatures {
    pub lags: Vec<Option<f64>>,
    pub rolling_means: Vec<Option<f64>>,
    pub rolling_stds: Vec<Option<f64>>,
    pub pct_changes: Vec<Option<f64>>,
}

impl SeriesFeatures {
    fn cells(&self, fill: f64) -> impl Iterator<Item = Cell> + '_ {
        self.lags
            .iter()
            .chain(self.rolling_means.iter())
            .chain(self.rolling_stds.iter())
            .chain(self.pct_changes.iter())
            .map(move |value| Cell::Number(value.filter(|v| v.is_finite()).unwrap_or(fill)))
    }
}

/// `{SERIES}_lag{k}`, `_rolling_mean_{w}`, `_rolling_std_{w}`, `_pct_change_{k}d`.
pub fn derived_column_names(series: &str, cfg: &PipelineConfig) -> Vec<String> {
    let mut names = Vec::new();
    for offset in &cfg.lag_offsets {
        names.push(format!("{series}_lag{offset}"));
    }
    for window in &cfg.rolling_windows {
        names.push(format!("{series}_rolling_mean_{window}"));
    }
    for window in &cfg.rolling_windows {
        names.push(format!("{series}_rolling_std_{window}"));
    }
    for offset in &cfg.lag_offsets {
        names.push(format!("{series}_pct_change_{offset}d"));
    }
    names
}

pub fn is_derived_column(column: &str) -> bool {
    DERIVED_MARKERS.iter().any(|marker| column.contains(marker))
}

/// Raw series columns: everything that is not metadata, calendar or derived.
pub fn currency_columns(columns: &[String]) -> Vec<String> {
    let excluded: HashSet<&str> = METADATA_COLUMNS
        .iter()
        .chain(CALENDAR_COLUMNS.iter())
        .copied()
        .collect();
    columns
        .iter()
        .filter(|column| !excluded.contains(column.as_str()) && !is_derived_column(column))
        .cloned()
        .collect()
}

pub fn calendar_features(at: NaiveDateTime) -> [(&'static str, i64); 6] {
    let month = at.month() as i64;
    [
        ("day_of_week", at.weekday().num_days_from_monday() as i64),
        ("day_of_month", at.day() as i64),
        ("month", month),
        ("quarter", (month - 1) / 3 + 1),
        ("year", at.year() as i64),
        ("hour", at.hour() as i64),
    ]
}

/// Features of row `idx` computed over `values[..=idx]`.
///
/// Rolling statistics use `min_periods = 1`: a window with at least one
/// observation yields a mean, and a sample std once it holds two.
pub fn series_features_at(
    values: &[Option<f64>],
    idx: usize,
    cfg: &PipelineConfig,
) -> SeriesFeatures {
    let lagged = |offset: usize| idx.checked_sub(offset).and_then(|i| values[i]);

    let lags = cfg.lag_offsets.iter().map(|offset| lagged(*offset)).collect();

    let windows: Vec<Vec<f64>> = cfg
        .rolling_windows
        .iter()
        .map(|window| {
            let start = (idx + 1).saturating_sub(*window);
            values[start..=idx].iter().flatten().copied().collect()
        })
        .collect();
    let rolling_means = windows.iter().map(|w| mean(w)).collect();
    let rolling_stds = windows.iter().map(|w| sample_std(w)).collect();

    let pct_changes = cfg
        .lag_offsets
        .iter()
        .map(|offset| match (values[idx], lagged(*offset)) {
            (Some(current), Some(base)) if base != 0.0 => Some((current - base) / base),
            _ => None,
        })
        .collect();

    SeriesFeatures {
        lags,
        rolling_means,
        rolling_stds,
        pct_changes,
    }
}

pub fn series_features(values: &[Option<f64>], cfg: &PipelineConfig) -> Vec<SeriesFeatures> {
    (0..values.len())
        .map(|idx| series_features_at(values, idx, cfg))
        .collect()
}

/// Derives the store row for `snapshot` given the store's current contents.
///
/// History that shares fewer than `min_common_columns` columns with the
/// snapshot is ignored, as is history without a collection timestamp.
pub fn derive(
    snapshot: &Snapshot,
    history: &Table,
    cfg: &PipelineConfig,
) -> Result<FeatureRow, FeatureError> {
    let current = current_table(snapshot)?;

    let common = if history.is_empty() {
        None
    } else {
        let common = common_columns(history.columns(), current.columns());
        if common.len() < cfg.min_common_columns
            || !common.iter().any(|column| column == COL_COLLECTION_DATETIME)
        {
            warn!(
                component = "features",
                event = "features.derive.history_incompatible",
                history_rows = history.len(),
                common_columns = common.len(),
                min_common_columns = cfg.min_common_columns
            );
            None
        } else {
            Some(common)
        }
    };

    let row = match common {
        Some(common) => derive_with_history(&current, history, &common, cfg)?,
        None => derive_without_history(&current, cfg),
    };

    info!(
        component = "features",
        event = "features.derive.finish",
        timestamp = %snapshot.timestamp,
        history_rows = history.len(),
        column_count = row.columns.len()
    );

    Ok(row)
}

fn current_table(snapshot: &Snapshot) -> Result<Table, TableError> {
    let base = snapshot.to_table()?;
    let mut columns = base.columns().to_vec();
    columns.extend(CALENDAR_COLUMNS.iter().map(|column| (*column).to_string()));

    let mut row = base.rows()[0].clone();
    row.extend(
        calendar_features(snapshot.collected_at)
            .iter()
            .map(|(_, value)| Cell::Number(*value as f64)),
    );

    let mut table = Table::new(columns)?;
    table.push_row(row)?;
    Ok(table)
}

fn major_series_in(columns: &[String], cfg: &PipelineConfig) -> Vec<String> {
    let currencies: HashSet<String> = currency_columns(columns).into_iter().collect();
    cfg.major_series
        .iter()
        .filter(|series| currencies.contains(series.as_str()))
        .cloned()
        .collect()
}

fn derive_with_history(
    current: &Table,
    history: &Table,
    common: &[String],
    cfg: &PipelineConfig,
) -> Result<FeatureRow, FeatureError> {
    let mut combined = history.select(common);
    combined.concat(current);
    combined.sort_by_datetime(COL_COLLECTION_DATETIME);

    // The snapshot row is normally last; a late snapshot keeps its own position.
    let aligned = current.select(common);
    let idx = combined
        .rows()
        .iter()
        .rposition(|row| row == &aligned.rows()[0])
        .unwrap_or(combined.len() - 1);
    let mut row = FeatureRow {
        columns: common.to_vec(),
        values: combined.rows()[idx].clone(),
    };

    for series in major_series_in(common, cfg) {
        let Some(values) = combined.numeric_column(&series) else {
            continue;
        };
        let features = series_features_at(&values, idx, cfg);
        for (name, cell) in derived_column_names(&series, cfg)
            .into_iter()
            .zip(features.cells(cfg.neutral_fill))
        {
            row.push(name, cell);
        }
    }

    Ok(row)
}

fn derive_without_history(current: &Table, cfg: &PipelineConfig) -> FeatureRow {
    let mut row = FeatureRow {
        columns: current.columns().to_vec(),
        values: current.rows()[0].clone(),
    };

    for series in major_series_in(current.columns(), cfg) {
        for name in derived_column_names(&series, cfg) {
            row.push(name, Cell::Number(cfg.neutral_fill));
        }
    }

    row
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn sample_std(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean = mean(values)?;
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((sum_sq / (n - 1) as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 11, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .unwrap()
    }

    #[test]
    fn derived_names_follow_store_convention() {
        let names = derived_column_names("EUR", &PipelineConfig::default());
        assert_eq!(
            names,
            vec![
                "EUR_lag1",
                "EUR_lag7",
                "EUR_rolling_mean_7",
                "EUR_rolling_mean_30",
                "EUR_rolling_std_7",
                "EUR_rolling_std_30",
                "EUR_pct_change_1d",
                "EUR_pct_change_7d",
            ]
        );
        assert!(names.iter().all(|name| is_derived_column(name)));
    }

    #[test]
    fn calendar_features_for_a_monday_in_q4() {
        let features = calendar_features(at(3, 14));
        assert_eq!(
            features,
            [
                ("day_of_week", 0),
                ("day_of_month", 3),
                ("month", 11),
                ("quarter", 4),
                ("year", 2025),
                ("hour", 14),
            ]
        );
    }

    #[test]
    fn rolling_window_uses_available_history() {
        let cfg = PipelineConfig::default();
        let values = vec![Some(2.0), Some(4.0)];
        let features = series_features_at(&values, 1, &cfg);
        assert_eq!(features.lags, vec![Some(2.0), None]);
        assert_eq!(features.rolling_means, vec![Some(3.0), Some(3.0)]);
        let std = features.rolling_stds[0].unwrap();
        assert!((std - 2.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(features.pct_changes, vec![Some(1.0), None]);

        let first = series_features_at(&values, 0, &cfg);
        assert_eq!(first.rolling_means, vec![Some(2.0), Some(2.0)]);
        assert_eq!(first.rolling_stds, vec![None, None]);
    }

    #[test]
    fn missing_observations_are_skipped_inside_windows() {
        let cfg = PipelineConfig::default();
        let values = vec![Some(1.0), None, Some(3.0)];
        let features = series_features_at(&values, 2, &cfg);
        assert_eq!(features.rolling_means[0], Some(2.0));
        assert_eq!(features.lags[0], None);
        assert_eq!(features.pct_changes[0], None);
    }

    #[test]
    fn zero_base_yields_no_pct_change() {
        let cfg = PipelineConfig::default();
        let features = series_features_at(&[Some(0.0), Some(1.0)], 1, &cfg);
        assert_eq!(features.pct_changes[0], None);
    }

    #[test]
    fn currency_columns_exclude_metadata_calendar_and_derived() {
        let columns: Vec<String> = [
            "timestamp",
            "collection_datetime",
            "time_last_updated",
            "EUR",
            "hour",
            "EUR_lag1",
            "GBP_rolling_mean_7",
            "JPY",
        ]
        .iter()
        .map(|c| (*c).to_string())
        .collect();
        assert_eq!(currency_columns(&columns), vec!["EUR", "JPY"]);
    }

    #[test]
    fn incompatible_history_is_treated_as_empty() {
        let cfg = PipelineConfig::default();
        let snapshot = Snapshot::from_numeric_rates(at(3, 9), [("EUR", 0.9), ("GBP", 0.8)]);

        let mut history = Table::new(vec!["foo".to_string(), "EUR".to_string()]).unwrap();
        history
            .push_row(vec![Cell::Number(1.0), Cell::Number(0.5)])
            .unwrap();

        let row = derive(&snapshot, &history, &cfg).unwrap();
        assert_eq!(row.get("EUR_lag1"), Some(&Cell::Number(0.0)));
        assert_eq!(row.get("GBP_rolling_std_30"), Some(&Cell::Number(0.0)));
        assert_eq!(row.get("hour"), Some(&Cell::Number(9.0)));
        assert!(row.get("JPY_lag1").is_none());
    }
}
