//! Inference HTTP surface: prediction plus drift flag.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::drift::assess_drift;
use crate::profile::{load_profile, DistributionProfile};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PredictorError(pub String);

/// A trained regressor over `n_lags` values, oldest first.
pub trait Predictor: Send + Sync {
    fn predict(&self, lags: &[f64]) -> Result<f64, PredictorError>;

    fn name(&self) -> &str {
        "predictor"
    }
}

/// Predicts the newest observed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistencePredictor;

impl Predictor for PersistencePredictor {
    fn predict(&self, lags: &[f64]) -> Result<f64, PredictorError> {
        lags.last()
            .copied()
            .ok_or_else(|| PredictorError("no lag values supplied".to_string()))
    }

    fn name(&self) -> &str {
        "persistence"
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for InferenceError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<PredictorError> for InferenceError {
    fn from(err: PredictorError) -> Self {
        Self::Internal(format!("prediction failed: {err}"))
    }
}

impl From<JsonRejection> for InferenceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Everything a request needs, loaded once at startup.
pub struct ServingContext {
    pub predictor: Option<Arc<dyn Predictor>>,
    pub profile: Option<DistributionProfile>,
    pub n_lags: usize,
    pub drift_z_cutoff: f64,
}

impl ServingContext {
    pub fn new(
        predictor: Option<Arc<dyn Predictor>>,
        profile: Option<DistributionProfile>,
        cfg: &PipelineConfig,
    ) -> Self {
        Self {
            predictor,
            profile,
            n_lags: cfg.n_lags,
            drift_z_cutoff: cfg.drift_z_cutoff,
        }
    }

    /// Loads the profile at `profile_path`; a missing or corrupt file
    /// disables drift detection instead of failing startup.
    pub fn with_profile_file(
        predictor: Option<Arc<dyn Predictor>>,
        profile_path: &Path,
        cfg: &PipelineConfig,
    ) -> Self {
        let profile = match load_profile(profile_path) {
            Ok(profile) => {
                info!(
                    component = "serving",
                    event = "serving.profile.loaded",
                    path = %profile_path.display(),
                    features = profile.features.len()
                );
                Some(profile)
            }
            Err(err) => {
                warn!(
                    component = "serving",
                    event = "serving.profile.unavailable",
                    path = %profile_path.display(),
                    error = %err
                );
                None
            }
        };
        Self::new(predictor, profile, cfg)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub history: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: f64,
    pub drift: bool,
    pub latency_ms: f64,
}

pub fn inference_router(ctx: Arc<ServingContext>) -> Router {
    Router::new()
        .route("/", get(get_home))
        .route("/health", get(get_health))
        .route("/predict", post(post_predict))
        .with_state(ctx)
}

async fn get_home() -> impl IntoResponse {
    Json(json!({ "message": "Exchange Rate Forecast API Running" }))
}

async fn get_health(State(ctx): State<Arc<ServingContext>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "model_loaded": ctx.predictor.is_some(),
        "profile_loaded": ctx.profile.is_some(),
        "n_lags": ctx.n_lags,
    }))
}

async fn post_predict(
    State(ctx): State<Arc<ServingContext>>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>, InferenceError> {
    let started = Instant::now();
    let result = predict(&ctx, payload, started);

    match &result {
        Ok(response) => info!(
            component = "serving",
            event = "http.predict.request",
            status = 200u16,
            drift = response.drift,
            latency_ms = response.latency_ms
        ),
        Err(err) => warn!(
            component = "serving",
            event = "http.predict.request",
            status = err_status(err).as_u16(),
            error = %err
        ),
    }

    result.map(Json)
}

fn predict(
    ctx: &ServingContext,
    payload: Result<Json<PredictRequest>, JsonRejection>,
    started: Instant,
) -> Result<PredictResponse, InferenceError> {
    let Json(request) = payload?;
    if request.history.len() < ctx.n_lags {
        return Err(InferenceError::BadRequest(format!(
            "history must contain at least {} values, got {}",
            ctx.n_lags,
            request.history.len()
        )));
    }
    let predictor = ctx
        .predictor
        .as_ref()
        .ok_or_else(|| InferenceError::Unavailable("model is not loaded".to_string()))?;

    let lags = &request.history[request.history.len() - ctx.n_lags..];
    let drift = assess_drift(lags, ctx.profile.as_ref(), ctx.drift_z_cutoff).drift();
    let prediction = predictor.predict(lags)?;

    Ok(PredictResponse {
        prediction,
        drift,
        latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
    })
}

fn err_status(err: &InferenceError) -> StatusCode {
    match err {
        InferenceError::BadRequest(_) => StatusCode::BAD_REQUEST,
        InferenceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        InferenceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
