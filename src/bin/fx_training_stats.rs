use fxpipe::{
    init_logging, load_target_series, log_app_start, log_pipeline_config, logging_config_from_env,
    pipeline_config_from_env, pipeline_paths_from_env, profile, save_profile,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("fx_training_stats", &logging_cfg);

    let cfg = pipeline_config_from_env()?;
    let paths = pipeline_paths_from_env();
    log_pipeline_config("fx_training_stats", &cfg, &paths);

    let series = load_target_series(&paths.store_path, &cfg.target_series)?;
    let stats = profile(&series, cfg.n_lags)?;
    save_profile(&paths.profile_path, &stats)?;

    println!(
        "Training statistics saved to {} ({} observations)",
        paths.profile_path.display(),
        series.len()
    );
    for (feature, s) in &stats.features {
        println!(
            "  {feature}: min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            s.min, s.max, s.mean, s.std
        );
    }

    Ok(())
}
