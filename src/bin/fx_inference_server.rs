use std::{net::SocketAddr, sync::Arc};

use fxpipe::{
    inference_router, init_logging, log_app_bind, log_app_start, log_pipeline_config,
    logging_config_from_env, pipeline_config_from_env, pipeline_paths_from_env,
    PersistencePredictor, Predictor, ServingContext,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("fx_inference_server", &logging_cfg);

    let addr: SocketAddr = std::env::var("FXPIPE_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8000".to_string())
        .parse()?;

    let cfg = pipeline_config_from_env()?;
    let paths = pipeline_paths_from_env();
    log_pipeline_config("fx_inference_server", &cfg, &paths);

    let predictor: Arc<dyn Predictor> = Arc::new(PersistencePredictor);
    let ctx = ServingContext::with_profile_file(Some(predictor), &paths.profile_path, &cfg);
    let app = inference_router(Arc::new(ctx));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
