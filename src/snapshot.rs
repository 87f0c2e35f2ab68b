//! Fetched rate snapshots and their single-row table form.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::table::{format_datetime, write_table, Cell, Table, TableError};

pub const COL_TIMESTAMP: &str = "timestamp";
pub const COL_COLLECTION_DATETIME: &str = "collection_datetime";
pub const COL_BASE_CURRENCY: &str = "base_currency";
pub const COL_API_DATE: &str = "api_date";
pub const COL_TIME_LAST_UPDATED: &str = "time_last_updated";

/// Columns the quality gate requires.
pub const REQUIRED_COLUMNS: [&str; 4] = [
    COL_TIMESTAMP,
    COL_COLLECTION_DATETIME,
    COL_BASE_CURRENCY,
    COL_API_DATE,
];

/// Every non-series column a snapshot carries.
pub const METADATA_COLUMNS: [&str; 5] = [
    COL_TIMESTAMP,
    COL_COLLECTION_DATETIME,
    COL_BASE_CURRENCY,
    COL_API_DATE,
    COL_TIME_LAST_UPDATED,
];

pub const DEFAULT_BASE_CURRENCY: &str = "USD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Compact run stamp, `%Y%m%d_%H%M%S`.
    pub timestamp: String,
    pub collected_at: NaiveDateTime,
    pub base_currency: String,
    pub api_date: String,
    pub time_last_updated: Cell,
    pub rates: BTreeMap<String, Cell>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload has no 'rates' object")]
    MissingRates,
    #[error("payload field '{0}' has an unexpected type")]
    UnexpectedType(&'static str),
    #[error("failed to write raw snapshot: {0}")]
    Write(#[from] TableError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Snapshot {
    pub fn new(collected_at: NaiveDateTime, rates: BTreeMap<String, Cell>) -> Self {
        let timestamp = run_stamp(collected_at);
        Self {
            timestamp: timestamp.clone(),
            collected_at,
            base_currency: DEFAULT_BASE_CURRENCY.to_string(),
            api_date: collected_at.date().format("%Y-%m-%d").to_string(),
            time_last_updated: Cell::Text(timestamp),
            rates,
        }
    }

    pub fn from_numeric_rates<I, K>(collected_at: NaiveDateTime, rates: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let rates = rates
            .into_iter()
            .map(|(code, rate)| (code.into(), Cell::Number(rate)))
            .collect();
        Self::new(collected_at, rates)
    }

    /// Builds a snapshot from a latest-rates API response body.
    pub fn from_api_payload(
        payload: &[u8],
        collected_at: NaiveDateTime,
    ) -> Result<Self, SnapshotError> {
        let value: Value = serde_json::from_slice(payload)?;
        let rates_obj = value
            .get("rates")
            .and_then(Value::as_object)
            .ok_or(SnapshotError::MissingRates)?;

        let rates = rates_obj
            .iter()
            .map(|(code, rate)| (code.clone(), json_cell(rate)))
            .collect();
        let mut snapshot = Self::new(collected_at, rates);

        match value.get("base") {
            Some(Value::String(base)) => snapshot.base_currency = base.clone(),
            Some(Value::Null) | None => {}
            Some(_) => return Err(SnapshotError::UnexpectedType("base")),
        }
        match value.get("date") {
            Some(Value::String(date)) => snapshot.api_date = date.clone(),
            Some(Value::Null) | None => {}
            Some(_) => return Err(SnapshotError::UnexpectedType("date")),
        }
        if let Some(updated) = value.get("time_last_updated") {
            if !updated.is_null() {
                snapshot.time_last_updated = json_cell(updated);
            }
        }

        Ok(snapshot)
    }

    pub fn series_count(&self) -> usize {
        self.rates.len()
    }

    pub fn columns(&self) -> Vec<String> {
        METADATA_COLUMNS
            .iter()
            .map(|column| (*column).to_string())
            .chain(self.rates.keys().cloned())
            .collect()
    }

    pub fn to_table(&self) -> Result<Table, TableError> {
        let mut table = Table::new(self.columns())?;
        let mut row = vec![
            Cell::Text(self.timestamp.clone()),
            Cell::Text(format_datetime(self.collected_at)),
            Cell::Text(self.base_currency.clone()),
            Cell::Text(self.api_date.clone()),
            self.time_last_updated.clone(),
        ];
        row.extend(self.rates.values().cloned());
        table.push_row(row)?;
        Ok(table)
    }

    /// Writes `exchange_rates_raw_<stamp>.csv` under `raw_dir`.
    pub fn write_raw(&self, raw_dir: &Path) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(raw_dir)?;
        let path = raw_dir.join(format!("exchange_rates_raw_{}.csv", self.timestamp));
        write_table(&path, &self.to_table()?)?;

        info!(
            component = "snapshot",
            event = "snapshot.raw.saved",
            path = %path.display(),
            series = self.series_count(),
            timestamp = %self.timestamp
        );

        Ok(path)
    }
}

pub fn run_stamp(collected_at: NaiveDateTime) -> String {
    collected_at.format("%Y%m%d_%H%M%S").to_string()
}

fn json_cell(value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Missing,
        Value::Number(number) => number.as_f64().map(Cell::Number).unwrap_or(Cell::Missing),
        Value::String(text) => Cell::Text(text.clone()),
        other => Cell::Text(other.to_string()),
    }
}
