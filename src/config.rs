//! Pipeline thresholds, feature windows and filesystem layout.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAJOR_SERIES: [&str; 5] = ["EUR", "GBP", "JPY", "CAD", "AUD"];
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub null_threshold: f64,
    pub min_currencies: usize,
    pub type_sample_size: usize,
    pub lag_offsets: Vec<usize>,
    pub rolling_windows: Vec<usize>,
    pub major_series: Vec<String>,
    pub neutral_fill: f64,
    pub min_common_columns: usize,
    pub n_lags: usize,
    pub target_series: String,
    pub drift_z_cutoff: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            null_threshold: 0.01,
            min_currencies: 10,
            type_sample_size: 5,
            lag_offsets: vec![1, 7],
            rolling_windows: vec![7, 30],
            major_series: DEFAULT_MAJOR_SERIES
                .iter()
                .map(|code| (*code).to_string())
                .collect(),
            neutral_fill: 0.0,
            min_common_columns: 5,
            n_lags: 3,
            target_series: "EUR".to_string(),
            drift_z_cutoff: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelinePaths {
    pub raw_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub store_path: PathBuf,
    pub profile_path: PathBuf,
}

impl Default for PipelinePaths {
    fn default() -> Self {
        Self::under_root(Path::new("data"))
    }
}

impl PipelinePaths {
    pub fn under_root(data_root: &Path) -> Self {
        Self {
            raw_dir: Some(data_root.join("raw")),
            reports_dir: Some(data_root.join("reports")),
            store_path: data_root.join("processed").join("exchange_rates.csv"),
            profile_path: PathBuf::from("models").join("training_stats.json"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("environment variable {key} has invalid value '{value}'")]
    InvalidEnv { key: &'static str, value: String },
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Windows large enough to cover every lag and rolling statistic.
    pub fn max_lookback(&self) -> usize {
        self.lag_offsets
            .iter()
            .chain(self.rolling_windows.iter())
            .copied()
            .max()
            .unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.null_threshold) {
            return Err(ConfigError::Invalid(format!(
                "null_threshold must be within 0..=1, got {}",
                self.null_threshold
            )));
        }

        if self.lag_offsets.is_empty() {
            return Err(ConfigError::Invalid(
                "lag_offsets must not be empty".to_string(),
            ));
        }
        check_positive_unique("lag_offsets", &self.lag_offsets)?;
        check_positive_unique("rolling_windows", &self.rolling_windows)?;

        if self.n_lags == 0 {
            return Err(ConfigError::Invalid("n_lags must be > 0".to_string()));
        }

        if !self.drift_z_cutoff.is_finite() || self.drift_z_cutoff <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "drift_z_cutoff must be a positive number, got {}",
                self.drift_z_cutoff
            )));
        }

        if self.target_series.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "target_series must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_positive_unique(name: &str, values: &[usize]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for value in values {
        if *value == 0 {
            return Err(ConfigError::Invalid(format!("{name} entries must be > 0")));
        }
        if !seen.insert(*value) {
            return Err(ConfigError::Invalid(format!(
                "{name} entries must be unique"
            )));
        }
    }
    Ok(())
}

/// Loads `FXPIPE_CONFIG` (if set), applies `FXPIPE_*` overrides and validates.
pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = match env::var("FXPIPE_CONFIG") {
        Ok(path) if !path.trim().is_empty() => PipelineConfig::from_json_file(Path::new(&path))?,
        _ => PipelineConfig::default(),
    };

    if let Some(value) = env_parsed::<f64>("FXPIPE_NULL_THRESHOLD")? {
        config.null_threshold = value;
    }
    if let Some(value) = env_parsed::<usize>("FXPIPE_MIN_CURRENCIES")? {
        config.min_currencies = value;
    }
    if let Some(value) = env_parsed::<f64>("FXPIPE_DRIFT_Z_CUTOFF")? {
        config.drift_z_cutoff = value;
    }
    if let Some(raw) = env_nonempty("FXPIPE_MAJOR_SERIES") {
        config.major_series = raw
            .split(',')
            .map(|code| code.trim().to_ascii_uppercase())
            .filter(|code| !code.is_empty())
            .collect();
    }
    if let Some(raw) = env_nonempty("FXPIPE_ROLLING_WINDOWS") {
        config.rolling_windows = parse_usize_list("FXPIPE_ROLLING_WINDOWS", &raw)?;
    }
    if let Some(raw) = env_nonempty("FXPIPE_TARGET_SERIES") {
        config.target_series = raw.trim().to_ascii_uppercase();
    }

    config.validate()?;
    Ok(config)
}

pub fn pipeline_paths_from_env() -> PipelinePaths {
    let mut paths = match env_nonempty("FXPIPE_DATA_ROOT") {
        Some(root) => PipelinePaths::under_root(Path::new(&root)),
        None => PipelinePaths::default(),
    };

    if let Some(store) = env_nonempty("FXPIPE_STORE_PATH") {
        paths.store_path = PathBuf::from(store);
    }
    if let Some(profile) = env_nonempty("FXPIPE_PROFILE_PATH") {
        paths.profile_path = PathBuf::from(profile);
    }
    if env_disabled("FXPIPE_KEEP_RAW") {
        paths.raw_dir = None;
    }
    if let Some(dir) = env_nonempty("FXPIPE_REPORTS_DIR") {
        paths.reports_dir = Some(PathBuf::from(dir));
    }
    if env_disabled("FXPIPE_KEEP_REPORTS") {
        paths.reports_dir = None;
    }

    paths
}

/// Rates fetch timeout from `FXPIPE_FETCH_TIMEOUT_MS`, 30 s when unset.
pub fn fetch_timeout_from_env() -> Result<Duration, ConfigError> {
    let ms = env_parsed::<u64>("FXPIPE_FETCH_TIMEOUT_MS")?.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS);
    if ms == 0 {
        return Err(ConfigError::Invalid("fetch timeout must be > 0 ms".to_string()));
    }
    Ok(Duration::from_millis(ms))
}

fn env_disabled(key: &str) -> bool {
    env_nonempty(key).is_some_and(|raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        )
    })
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_nonempty(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
        None => Ok(None),
    }
}

fn parse_usize_list(key: &'static str, raw: &str) -> Result<Vec<usize>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
                key,
                value: raw.to_string(),
            })
        })
        .collect()
}
