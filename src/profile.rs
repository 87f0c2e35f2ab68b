//! Training-set construction and lag-feature distribution profiles.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::snapshot::COL_COLLECTION_DATETIME;
use crate::table::{parse_datetime_cell, read_lenient, write_atomic, TableError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient data: need at least {required} observations, have {available}")]
pub struct InsufficientDataError {
    pub required: usize,
    pub available: usize,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid profile JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("store {path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("store {path} has no usable rows")]
    EmptyStore { path: PathBuf },
    #[error(transparent)]
    InsufficientData(#[from] InsufficientDataError),
}

/// Lag matrix and aligned targets. Row `t` holds `lag_1..lag_n` for target `t`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    n_lags: usize,
    features: Vec<Vec<f64>>,
    targets: Vec<f64>,
}

impl TrainingSet {
    pub fn from_series(series: &[f64], n_lags: usize) -> Result<Self, InsufficientDataError> {
        let required = n_lags + 1;
        if series.len() < required {
            return Err(InsufficientDataError {
                required,
                available: series.len(),
            });
        }

        let (features, targets) = (n_lags..series.len())
            .map(|t| {
                let lags: Vec<f64> = (1..=n_lags).map(|lag| series[t - lag]).collect();
                (lags, series[t])
            })
            .unzip();

        Ok(Self {
            n_lags,
            features,
            targets,
        })
    }

    pub fn n_lags(&self) -> usize {
        self.n_lags
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn features(&self) -> &[Vec<f64>] {
        &self.features
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    pub fn feature_names(&self) -> Vec<String> {
        (1..=self.n_lags).map(lag_feature_name).collect()
    }

    /// Values of `lag_{lag}` across all rows; `lag` is 1-based.
    pub fn column(&self, lag: usize) -> Vec<f64> {
        self.features.iter().map(|row| row[lag - 1]).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl FeatureStats {
    /// `None` on an empty slice. A single value has std 0.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / n;
        let std = if values.len() < 2 {
            0.0
        } else {
            let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (sum_sq / (n - 1.0)).sqrt()
        };
        Some(Self {
            min,
            max,
            mean,
            std,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionProfile {
    pub features: BTreeMap<String, FeatureStats>,
    pub timestamp: NaiveDateTime,
}

impl DistributionProfile {
    pub fn feature(&self, name: &str) -> Option<&FeatureStats> {
        self.features.get(name)
    }

    pub fn from_training_set(training: &TrainingSet, timestamp: NaiveDateTime) -> Self {
        let features = (1..=training.n_lags())
            .filter_map(|lag| {
                FeatureStats::from_values(&training.column(lag))
                    .map(|stats| (lag_feature_name(lag), stats))
            })
            .collect();
        Self {
            features,
            timestamp,
        }
    }
}

pub fn lag_feature_name(lag: usize) -> String {
    format!("lag_{lag}")
}

pub fn profile(
    series: &[f64],
    n_lags: usize,
) -> Result<DistributionProfile, InsufficientDataError> {
    profile_at(series, n_lags, Utc::now().naive_utc())
}

pub fn profile_at(
    series: &[f64],
    n_lags: usize,
    timestamp: NaiveDateTime,
) -> Result<DistributionProfile, InsufficientDataError> {
    let training = TrainingSet::from_series(series, n_lags)?;
    Ok(DistributionProfile::from_training_set(&training, timestamp))
}

/// Target values from the store, oldest first. Rows with an unparsable
/// timestamp or a non-numeric target are skipped.
pub fn load_target_series(store_path: &Path, target: &str) -> Result<Vec<f64>, ProfileError> {
    let parsed = read_lenient(store_path)?;
    let table = parsed.table;

    let missing_column = |column: &str| ProfileError::MissingColumn {
        path: store_path.to_path_buf(),
        column: column.to_string(),
    };
    let ts_idx = table
        .column_index(COL_COLLECTION_DATETIME)
        .ok_or_else(|| missing_column(COL_COLLECTION_DATETIME))?;
    let target_idx = table
        .column_index(target)
        .ok_or_else(|| missing_column(target))?;

    let mut points: Vec<(NaiveDateTime, f64)> = table
        .rows()
        .iter()
        .filter_map(|row| {
            let at = parse_datetime_cell(&row[ts_idx])?;
            let value = row[target_idx].as_f64()?;
            Some((at, value))
        })
        .collect();

    if points.is_empty() {
        return Err(ProfileError::EmptyStore {
            path: store_path.to_path_buf(),
        });
    }
    points.sort_by(|a, b| a.0.cmp(&b.0));

    info!(
        component = "profile",
        event = "profile.series.loaded",
        path = %store_path.display(),
        target_series = target,
        rows = points.len(),
        skipped_lines = parsed.skipped.len()
    );

    Ok(points.into_iter().map(|(_, value)| value).collect())
}

pub fn save_profile(path: &Path, profile: &DistributionProfile) -> Result<(), ProfileError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| ProfileError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    let bytes = serde_json::to_vec_pretty(profile)?;
    write_atomic(path, &bytes)?;

    info!(
        component = "profile",
        event = "profile.saved",
        path = %path.display(),
        features = profile.features.len()
    );
    Ok(())
}

pub fn load_profile(path: &Path) -> Result<DistributionProfile, ProfileError> {
    let raw = fs::read(path).map_err(|source| ProfileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&raw)?)
}
