use std::path::Path;

use chrono::Utc;
use fxpipe::{
    fetch_timeout_from_env, init_logging, log_app_start, log_pipeline_config,
    logging_config_from_env, pipeline_config_from_env, pipeline_paths_from_env, run_pipeline,
    Snapshot,
};
use reqwest::blocking::Client;

const DEFAULT_RATES_URL: &str = "https://api.exchangerate-api.com/v4/latest/USD";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("fx_pipeline_run", &logging_cfg);

    let source = std::env::args()
        .nth(1)
        .ok_or("usage: fx_pipeline_run <payload.json | --fetch>")?;

    let cfg = pipeline_config_from_env()?;
    let paths = pipeline_paths_from_env();
    log_pipeline_config("fx_pipeline_run", &cfg, &paths);

    let collected_at = Utc::now().naive_utc();
    let payload = if source == "--fetch" {
        fetch_payload()?
    } else {
        std::fs::read(Path::new(&source))?
    };
    let snapshot = Snapshot::from_api_payload(&payload, collected_at)?;
    let report = run_pipeline(&snapshot, &paths, &cfg)?;

    println!(
        "Pipeline run {} | outcome={} history_rows={} columns={} store={}",
        report.timestamp,
        report.outcome.label(),
        report.history_rows,
        report.derived_columns,
        paths.store_path.display()
    );
    if let Some(backup) = report.outcome.backup() {
        println!("Backup written to {}", backup.display());
    }
    if let Some(path) = &report.report_path {
        println!("Data profile written to {}", path.display());
    }

    Ok(())
}

fn fetch_payload() -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let url =
        std::env::var("FXPIPE_RATES_URL").unwrap_or_else(|_| DEFAULT_RATES_URL.to_string());
    let client = Client::builder()
        .timeout(fetch_timeout_from_env()?)
        .build()?;
    let response = client.get(&url).send()?.error_for_status()?;
    Ok(response.bytes()?.to_vec())
}
