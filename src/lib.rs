//! fxpipe core crate.
//!
//! Current implemented scope:
//! - snapshot quality gate and raw snapshot persistence
//! - calendar, lag, rolling and rate-of-change feature derivation
//! - schema-reconciling historical CSV store with verified backups
//! - per-run data profile reports of the processed store
//! - lag-feature distribution profiles and inference-time drift checks
//! - inference HTTP router over a pluggable predictor

mod config;
mod drift;
mod features;
mod observability;
mod pipeline;
mod profile;
mod quality;
mod report;
mod serving;
mod snapshot;
mod store;
mod table;

pub use config::{
    fetch_timeout_from_env, pipeline_config_from_env, pipeline_paths_from_env, ConfigError,
    PipelineConfig, PipelinePaths, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAJOR_SERIES,
};
pub use drift::{assess_drift, is_drift, DriftAssessment, PositionVerdict};
pub use features::{
    calendar_features, currency_columns, derive, derived_column_names, is_derived_column,
    series_features, series_features_at, FeatureError, FeatureRow, SeriesFeatures,
    CALENDAR_COLUMNS,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_pipeline_config, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{run_pipeline, PipelineError, PipelineRunReport};
pub use profile::{
    lag_feature_name, load_profile, load_target_series, profile, profile_at, save_profile,
    DistributionProfile, FeatureStats, InsufficientDataError, ProfileError, TrainingSet,
};
pub use quality::{
    validate, validate_table, CheckOutcome, DataQualityError, QualityCheck, QualityReport,
};
pub use report::{
    report, save_report, summarize_columns, ColumnSummary, DataProfileReport, ReportError,
};
pub use serving::{
    inference_router, InferenceError, PersistencePredictor, PredictRequest, PredictResponse,
    Predictor, PredictorError, ServingContext,
};
pub use snapshot::{
    run_stamp, Snapshot, SnapshotError, COL_API_DATE, COL_BASE_CURRENCY, COL_COLLECTION_DATETIME,
    COL_TIMESTAMP, COL_TIME_LAST_UPDATED, DEFAULT_BASE_CURRENCY, METADATA_COLUMNS,
    REQUIRED_COLUMNS,
};
pub use store::{
    backup_path_for, backup_store, load_history, lock_path_for, reconcile, reconcile_at,
    reconcile_locked, FreshStartReason, ReconcileOutcome, StoreError, StoreLock,
};
pub use table::{
    append_rows, common_columns, encode_csv, format_datetime, parse_datetime, parse_datetime_cell,
    probe_header, read_lenient, write_table, Cell, LenientParse, SkippedLine, Table, TableError,
};
