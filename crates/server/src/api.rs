//! HTTP API: health checks, Prometheus metrics and predictions

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use forecast_lib::{
    format_sensor_id,
    health::{ComponentStatus, HealthRegistry},
    observability::ForecastMetrics,
    persistence::PersistStatus,
    predictor::{Prediction, Predictor, SensorSample, SensorSampler},
    ForecastError, SensorStatistics,
};
use ndarray::Array2;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ForecastMetrics,
    pub predictor: Predictor,
    /// `None` when the dataset could not be loaded; demo and stats routes
    /// answer 503 until it is
    pub sampler: Option<SensorSampler>,
    pub lookback: usize,
    pub persist_demo_predictions: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// True when the condition clears once setup is completed
    pub retryable: bool,
}

/// Errors surfaced by the prediction routes
#[derive(Debug)]
pub enum ApiError {
    Forecast(ForecastError),
    DatasetUnavailable,
    /// The blocking inference task panicked or was cancelled
    Worker(String),
}

impl From<ForecastError> for ApiError {
    fn from(e: ForecastError) -> Self {
        ApiError::Forecast(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message, retryable) = match &self {
            ApiError::DatasetUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "dataset_unavailable",
                "Sensor dataset is not loaded; download it and restart the server".to_string(),
                true,
            ),
            ApiError::Worker(reason) => {
                error!(error = %reason, "Inference task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "prediction_failed",
                    "Inference task failed".to_string(),
                    false,
                )
            }
            ApiError::Forecast(e) => {
                let (status, code) = match e {
                    ForecastError::NotFound { .. } => (StatusCode::SERVICE_UNAVAILABLE, "not_found"),
                    ForecastError::ModelNotLoaded => {
                        (StatusCode::SERVICE_UNAVAILABLE, "model_not_loaded")
                    }
                    ForecastError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                    ForecastError::SensorOutOfRange { .. } => {
                        (StatusCode::BAD_REQUEST, "sensor_out_of_range")
                    }
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "prediction_failed"),
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %e, "Request failed");
                }
                (status, code, e.to_string(), e.is_retryable_after_setup())
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
            retryable,
        };
        (status, Json(body)).into_response()
    }
}

/// Run model work on the blocking pool so forward passes never stall the async workers
async fn run_blocking<T, F>(state: Arc<AppState>, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || work(&state))
        .await
        .map_err(|e| ApiError::Worker(e.to_string()))?
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct DemoQuery {
    pub sensor_id: Option<String>,
    pub persist: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DemoResponse {
    pub sensor_id: String,
    pub sensor_index: usize,
    pub time_index: usize,
    pub flow_prediction: f32,
    pub density_prediction: f32,
    pub congestion_status: u8,
    pub congestion_level: String,
    pub confidence: f32,
    pub prediction_time: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub model_type: String,
    pub model_version: String,
    pub persistence: PersistStatus,
    pub input_data: Vec<Vec<f32>>,
    pub sensor_stats: SensorStatistics,
}

/// Sample a real window from the dataset and predict on it
async fn predict_demo(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DemoQuery>,
) -> Result<Json<DemoResponse>, ApiError> {
    let response = run_blocking(state, move |state| {
        let sampler = state.sampler.as_ref().ok_or(ApiError::DatasetUnavailable)?;
        let sample = sampler.sample_sequence(state.lookback, query.sensor_id.as_deref())?;
        let sensor_id = format_sensor_id(sample.sensor_index);

        let persist = query.persist.unwrap_or(state.persist_demo_predictions);
        let prediction = state
            .predictor
            .predict(sample.window.view(), Some(&sensor_id), persist, None)?;
        let stats = sampler.get_sensor_statistics(sample.sensor_index)?;
        Ok(demo_response(sensor_id, sample, prediction, stats))
    })
    .await?;
    Ok(Json(response))
}

fn demo_response(
    sensor_id: String,
    sample: SensorSample,
    prediction: Prediction,
    stats: SensorStatistics,
) -> DemoResponse {
    let result = prediction.result;
    DemoResponse {
        sensor_id,
        sensor_index: sample.sensor_index,
        time_index: sample.time_index,
        flow_prediction: result.flow,
        density_prediction: result.density,
        congestion_status: result.congestion_status,
        congestion_level: result.congestion_level,
        confidence: result.confidence,
        prediction_time: result.prediction_time,
        target_time: result.target_time,
        model_type: result.model_type,
        model_version: result.model_version,
        persistence: prediction.persistence,
        input_data: sample.window.outer_iter().map(|row| row.to_vec()).collect(),
        sensor_stats: stats,
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub sensor_id: Option<String>,
    /// (lookback, features) rows
    pub sequence_data: Vec<Vec<f32>>,
    #[serde(default)]
    pub persist: bool,
    pub target_time: Option<DateTime<Utc>>,
}

/// Predict on caller-supplied, already scaled input
async fn predict(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let window = rows_to_window(&request.sequence_data)?;
    let prediction = run_blocking(state, move |state| {
        Ok(state.predictor.predict(
            window.view(),
            request.sensor_id.as_deref(),
            request.persist,
            request.target_time,
        )?)
    })
    .await?;
    Ok(Json(prediction))
}

async fn sensor_stats(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> Result<Json<SensorStatistics>, ApiError> {
    let sampler = state.sampler.as_ref().ok_or(ApiError::DatasetUnavailable)?;
    Ok(Json(sampler.get_sensor_statistics(index)?))
}

fn rows_to_window(rows: &[Vec<f32>]) -> Result<Array2<f32>, ForecastError> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if rows.is_empty() || width == 0 {
        return Err(ForecastError::InvalidInput(
            "sequence_data must contain at least one non-empty row".to_string(),
        ));
    }
    if let Some(i) = rows.iter().position(|r| r.len() != width) {
        return Err(ForecastError::InvalidInput(format!(
            "sequence_data row {i} has {} values, expected {width}",
            rows[i].len()
        )));
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), width), flat)
        .map_err(|e| ForecastError::InvalidInput(e.to_string()))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/predict/demo", get(predict_demo))
        .route("/predict", post(predict))
        .route("/sensors/:index/stats", get(sensor_stats))
        .with_state(state)
}

/// Run the API server until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
