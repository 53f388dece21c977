//! Integration tests for the forecast server routes

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use candle_core::Device;
use forecast_lib::{
    data::RawSeries,
    health::{components, HealthRegistry},
    model::{ModelConfig, ModelKind, RecurrentRegressor},
    observability::ForecastMetrics,
    persistence::{MemoryStore, PersistenceConfig, PersistenceWorker},
    predictor::{LoadedModel, ModelHandle, Predictor, PredictorConfig, SamplingMode, SensorSampler},
};
use ndarray::Array3;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use traffic_server::{create_router, AppState};

const LOOKBACK: usize = 12;

fn tiny_model() -> LoadedModel {
    let config = ModelConfig {
        model_type: ModelKind::Gru,
        hidden_size: 4,
        num_layers: 1,
        dropout: 0.0,
        ..Default::default()
    };
    let model = RecurrentRegressor::new(config, &Device::Cpu).unwrap();
    LoadedModel::from_model(model, "gru-test")
}

fn sampler() -> SensorSampler {
    let data = Array3::from_shape_fn((40, 5, 3), |(t, s, f)| {
        (t as f32 * 0.1 + s as f32 + f as f32 * 10.0).sin().abs() * 50.0
    });
    let series = RawSeries::from_array(data).unwrap();
    SensorSampler::new(Arc::new(series), SamplingMode::Seeded { seed: 7 })
}

struct TestApp {
    router: Router,
    state: Arc<AppState>,
}

async fn setup_test_app(with_model: bool, with_dataset: bool) -> TestApp {
    let health_registry = HealthRegistry::new();
    let handle = if with_model {
        health_registry.set_healthy(components::MODEL).await;
        ModelHandle::with_model(tiny_model())
    } else {
        health_registry
            .set_unhealthy(components::MODEL, "checkpoint not found")
            .await;
        ModelHandle::empty()
    };

    let predictor = Predictor::new(handle, PredictorConfig::default(), None).unwrap();
    let state = Arc::new(AppState {
        health_registry,
        metrics: ForecastMetrics::new(),
        predictor,
        sampler: with_dataset.then(sampler),
        lookback: LOOKBACK,
        persist_demo_predictions: false,
    });
    TestApp {
        router: create_router(state.clone()),
        state,
    }
}

async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(router: Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn scaled_sequence() -> serde_json::Value {
    let rows: Vec<Vec<f32>> = (0..LOOKBACK)
        .map(|t| vec![0.1 * t as f32 / LOOKBACK as f32, 0.4, 0.6])
        .collect();
    serde_json::json!(rows)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app(true, true).await;
    let (status, health) = get(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["model"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app(true, true).await;
    app.state
        .health_registry
        .set_degraded(components::PERSISTENCE, "write timed out after 2000ms")
        .await;

    let (status, health) = get(app.router, "/healthz").await;

    // Degraded still serves traffic
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"]["persistence"]["message"],
        "write timed out after 2000ms"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_without_model() {
    let app = setup_test_app(false, true).await;
    let (status, health) = get(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_requires_startup_and_model() {
    let app = setup_test_app(true, true).await;
    let (status, readiness) = get(app.router.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    app.state.health_registry.set_ready(true).await;
    let (status, readiness) = get(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_model_missing() {
    let app = setup_test_app(false, true).await;
    app.state.health_registry.set_ready(true).await;

    let (status, readiness) = get(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(readiness["reason"]
        .as_str()
        .unwrap()
        .starts_with("Model unavailable"));
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let app = setup_test_app(true, true).await;
    app.state.metrics.observe_prediction_latency(0.002);
    app.state.metrics.inc_predictions();

    let response = app
        .router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("traffic_forecast_prediction_latency_seconds_bucket"));
    assert!(text.contains("traffic_forecast_predictions_total"));
}

#[tokio::test]
async fn test_demo_prediction_for_named_sensor() {
    let app = setup_test_app(true, true).await;
    let (status, body) = get(app.router, "/predict/demo?sensor_id=sensor_003").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sensor_id"], "sensor_003");
    assert_eq!(body["sensor_index"], 3);
    assert_eq!(body["model_type"], "gru");
    assert_eq!(body["model_version"], "gru-test");
    assert_eq!(body["persistence"]["status"], "not_requested");

    let level = body["congestion_status"].as_u64().unwrap();
    assert!(level <= 3);
    let confidence = body["confidence"].as_f64().unwrap();
    assert!((confidence - 0.85).abs() < 1e-6);

    let input = body["input_data"].as_array().unwrap();
    assert_eq!(input.len(), LOOKBACK);
    assert_eq!(input[0].as_array().unwrap().len(), 3);
    assert_eq!(body["sensor_stats"]["sensor_index"], 3);
    assert_eq!(body["sensor_stats"]["num_timesteps"], 40);
    let time_index = body["time_index"].as_u64().unwrap();
    assert!(time_index as usize <= 40 - LOOKBACK);
}

#[tokio::test]
async fn test_demo_prediction_random_sensor_in_range() {
    let app = setup_test_app(true, true).await;
    let (status, body) = get(app.router, "/predict/demo").await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["sensor_index"].as_u64().unwrap() < 5);
}

#[tokio::test]
async fn test_demo_rejects_unknown_sensor() {
    let app = setup_test_app(true, true).await;

    let (status, body) = get(app.router.clone(), "/predict/demo?sensor_id=sensor_400").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "sensor_out_of_range");

    let (status, body) = get(app.router, "/predict/demo?sensor_id=north_gate").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn test_demo_without_model_is_503() {
    let app = setup_test_app(false, true).await;
    let (status, body) = get(app.router, "/predict/demo?sensor_id=1").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "model_not_loaded");
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_demo_without_dataset_is_503() {
    let app = setup_test_app(true, false).await;

    let (status, body) = get(app.router.clone(), "/predict/demo").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "dataset_unavailable");

    let (status, _) = get(app.router, "/sensors/0/stats").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_predict_with_supplied_sequence() {
    let app = setup_test_app(true, true).await;
    let request = serde_json::json!({
        "sensor_id": "sensor_010",
        "sequence_data": scaled_sequence(),
        "target_time": "2024-03-01T12:00:00Z",
    });

    let (status, body) = post_json(app.router, "/predict", request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sensor_id"], "sensor_010");
    assert_eq!(body["target_time"], "2024-03-01T12:00:00Z");
    assert!(body["flow"].as_f64().unwrap().is_finite());
    assert!(body["density"].as_f64().unwrap().is_finite());
    assert_eq!(body["persistence"]["status"], "not_requested");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_predict_requests_agree() {
    let app = setup_test_app(true, true).await;
    let request = serde_json::json!({ "sequence_data": scaled_sequence() });

    let calls = (0..6).map(|_| post_json(app.router.clone(), "/predict", request.clone()));
    let responses = futures_join_all(calls).await;

    let (first_status, first) = &responses[0];
    assert_eq!(*first_status, StatusCode::OK);
    for (status, body) in &responses {
        assert_eq!(*status, StatusCode::OK);
        assert_eq!(body["flow"], first["flow"]);
        assert_eq!(body["density"], first["density"]);
    }
    assert_eq!(app.state.predictor.stats().total_inferences, 6);
}

/// Drive futures concurrently on the runtime and collect results in order
async fn futures_join_all<F, T>(futures: impl Iterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = futures.map(tokio::spawn).collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test]
async fn test_predict_rejects_malformed_sequence() {
    let app = setup_test_app(true, true).await;

    let ragged = serde_json::json!({ "sequence_data": [[0.1, 0.2, 0.3], [0.4]] });
    let (status, body) = post_json(app.router.clone(), "/predict", ragged).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");

    let two_features = serde_json::json!({ "sequence_data": [[0.1, 0.2], [0.3, 0.4]] });
    let (status, _) = post_json(app.router.clone(), "/predict", two_features).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let empty = serde_json::json!({ "sequence_data": [] });
    let (status, _) = post_json(app.router, "/predict", empty).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_predict_persist_without_store_is_reported() {
    let app = setup_test_app(true, true).await;
    let request = serde_json::json!({
        "sensor_id": "sensor_001",
        "sequence_data": scaled_sequence(),
        "persist": true,
    });

    let (status, body) = post_json(app.router, "/predict", request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["persistence"]["status"], "rejected");
    assert_eq!(body["persistence"]["reason"], "persistence is disabled");
}

#[tokio::test]
async fn test_demo_persists_through_worker() {
    let store = Arc::new(MemoryStore::new());
    let (queue, worker) = PersistenceWorker::spawn(store.clone(), &PersistenceConfig::default(), None);
    let predictor = Predictor::new(
        ModelHandle::with_model(tiny_model()),
        PredictorConfig::default(),
        Some(queue),
    )
    .unwrap();
    let state = Arc::new(AppState {
        health_registry: HealthRegistry::new(),
        metrics: ForecastMetrics::new(),
        predictor,
        sampler: Some(sampler()),
        lookback: LOOKBACK,
        persist_demo_predictions: true,
    });

    let (status, body) = get(create_router(state), "/predict/demo?sensor_id=sensor_002").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["persistence"]["status"], "queued");

    // The router and state are gone, so the queue is closed
    worker.shutdown(Duration::from_secs(5)).await;
    let records = store.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sensor_id, "sensor_002");
    assert_eq!(records[0].model_version, "gru-test");
}

#[tokio::test]
async fn test_sensor_stats_route() {
    let app = setup_test_app(true, true).await;

    let (status, stats) = get(app.router.clone(), "/sensors/4/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["sensor_index"], 4);
    assert!(stats["flow"]["max"].as_f64().unwrap() >= stats["flow"]["min"].as_f64().unwrap());

    let (status, _) = get(app.router, "/sensors/5/stats").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
