//! Observability for the forecasting service
//!
//! Provides:
//! - Prometheus metrics (prediction latency and counts, persistence outcomes,
//!   training progress, loaded model)
//! - Structured logging of well-known events with tracing

use prometheus::{
    register_gauge, register_gauge_vec, register_histogram, register_int_counter, Gauge, GaugeVec,
    Histogram, IntCounter,
};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::model::SavedCheckpoint;
use crate::models::PredictionResult;
use crate::training::TrainingRecord;

/// Histogram buckets for inference latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ForecastMetricsInner> = OnceLock::new();

struct ForecastMetricsInner {
    prediction_latency_seconds: Histogram,
    predictions_total: IntCounter,
    prediction_errors_total: IntCounter,
    persisted_records_total: IntCounter,
    persistence_failures_total: IntCounter,
    training_epochs_total: IntCounter,
    last_val_loss: Gauge,
    model_info: GaugeVec,
}

impl ForecastMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "traffic_forecast_prediction_latency_seconds",
                "Time spent running model inference for one prediction",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            predictions_total: register_int_counter!(
                "traffic_forecast_predictions_total",
                "Total number of predictions generated"
            )
            .expect("Failed to register predictions_total"),

            prediction_errors_total: register_int_counter!(
                "traffic_forecast_prediction_errors_total",
                "Total number of failed prediction requests"
            )
            .expect("Failed to register prediction_errors_total"),

            persisted_records_total: register_int_counter!(
                "traffic_forecast_persisted_records_total",
                "Prediction records written to the store"
            )
            .expect("Failed to register persisted_records_total"),

            persistence_failures_total: register_int_counter!(
                "traffic_forecast_persistence_failures_total",
                "Prediction records that could not be written or queued"
            )
            .expect("Failed to register persistence_failures_total"),

            training_epochs_total: register_int_counter!(
                "traffic_forecast_training_epochs_total",
                "Training epochs completed in this process"
            )
            .expect("Failed to register training_epochs_total"),

            last_val_loss: register_gauge!(
                "traffic_forecast_last_val_loss",
                "Validation loss of the most recent training epoch"
            )
            .expect("Failed to register last_val_loss"),

            model_info: register_gauge_vec!(
                "traffic_forecast_model_info",
                "Information about the currently loaded model",
                &["model_type", "version"]
            )
            .expect("Failed to register model_info"),
        }
    }
}

/// Handle to the process-wide forecasting metrics
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct ForecastMetrics {
    _private: (),
}

impl Default for ForecastMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ForecastMetrics {
    /// Create a handle, registering the metrics on first use
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ForecastMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &'static ForecastMetricsInner {
        GLOBAL_METRICS.get_or_init(ForecastMetricsInner::new)
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn inc_predictions(&self) {
        self.inner().predictions_total.inc();
    }

    pub fn inc_prediction_errors(&self) {
        self.inner().prediction_errors_total.inc();
    }

    pub fn inc_persisted_records(&self) {
        self.inner().persisted_records_total.inc();
    }

    pub fn inc_persistence_failures(&self) {
        self.inner().persistence_failures_total.inc();
    }

    pub fn inc_training_epochs(&self) {
        self.inner().training_epochs_total.inc();
    }

    pub fn set_last_val_loss(&self, loss: f64) {
        self.inner().last_val_loss.set(loss);
    }

    /// Replace the loaded-model info series
    pub fn set_model_info(&self, model_type: &str, version: &str) {
        self.inner().model_info.reset();
        self.inner()
            .model_info
            .with_label_values(&[model_type, version])
            .set(1.0);
    }

    pub fn clear_model_info(&self) {
        self.inner().model_info.reset();
    }

    pub fn predictions_count(&self) -> u64 {
        self.inner().predictions_total.get()
    }

    pub fn persistence_failures_count(&self) -> u64 {
        self.inner().persistence_failures_total.get()
    }
}

/// Emits well-known events with an `event` field
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_startup(&self, version: &str, model_version: Option<&str>) {
        info!(
            event = "server_started",
            component = %self.component,
            server_version = %version,
            model_version = model_version.unwrap_or("none"),
            "Traffic forecast server started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            component = %self.component,
            reason = %reason,
            "Traffic forecast server shutting down"
        );
    }

    pub fn log_model_loaded(&self, model_type: &str, version: &str, path: &Path, parameters: usize) {
        info!(
            event = "model_loaded",
            component = %self.component,
            model_type = %model_type,
            model_version = %version,
            path = %path.display(),
            parameters = parameters,
            "Model loaded"
        );
    }

    pub fn log_prediction(&self, result: &PredictionResult) {
        info!(
            event = "prediction_generated",
            component = %self.component,
            sensor_id = result.sensor_id.as_deref().unwrap_or("-"),
            flow = result.flow,
            density = result.density,
            congestion_status = result.congestion_status,
            congestion_level = %result.congestion_level,
            confidence = result.confidence,
            model_version = %result.model_version,
            "Generated traffic prediction"
        );
    }

    pub fn log_persistence_failed(&self, sensor_id: &str, reason: &str) {
        warn!(
            event = "persistence_failed",
            component = %self.component,
            sensor_id = %sensor_id,
            reason = %reason,
            "Prediction record was not persisted"
        );
    }

    pub fn log_epoch(&self, epoch: usize, train_loss: f64, val_loss: f64, learning_rate: f64, duration_secs: f64) {
        info!(
            event = "epoch_completed",
            component = %self.component,
            epoch = epoch,
            train_loss = train_loss,
            val_loss = val_loss,
            learning_rate = learning_rate,
            duration_secs = duration_secs,
            "Epoch completed"
        );
    }

    pub fn log_checkpoint_saved(&self, saved: &SavedCheckpoint, tag: &str, epoch: usize) {
        info!(
            event = "checkpoint_saved",
            component = %self.component,
            tag = %tag,
            epoch = epoch,
            path = %saved.path.display(),
            sha256 = %saved.sha256,
            "Checkpoint saved"
        );
    }

    pub fn log_training_finished(&self, record: &TrainingRecord) {
        info!(
            event = "training_finished",
            component = %self.component,
            model_name = %record.model_name,
            model_version = %record.model_version,
            status = ?record.status,
            epochs_run = record.epochs_run,
            best_epoch = ?record.best_epoch,
            best_val_loss = ?record.best_val_loss,
            duration_secs = record.duration_seconds,
            "Training run finished"
        );
    }
}
