//! Model inference and congestion classification
//!
//! The serving layer owns a [`ModelHandle`] and passes it into each
//! [`Predictor`]; there is no process-wide "current model".

use candle_core::{Device, Tensor};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

use super::confidence::ConfidenceMode;
use super::congestion::CongestionCalibration;
use crate::error::{ForecastError, Result};
use crate::model::{load_checkpoint, LoadedCheckpoint, RecurrentRegressor, TrainingMetadata};
use crate::models::{PredictionRecord, PredictionResult};
use crate::observability::{ForecastMetrics, StructuredLogger};
use crate::persistence::{PersistStatus, PersistenceQueue};

/// Inference slower than this is logged as a warning
const SLOW_INFERENCE_MS: u128 = 250;

/// A model ready for inference plus where it came from
#[derive(Debug)]
pub struct LoadedModel {
    pub model: RecurrentRegressor,
    pub version: String,
    pub source: Option<PathBuf>,
    pub metadata: Option<TrainingMetadata>,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedModel {
    pub fn from_checkpoint(checkpoint: LoadedCheckpoint, source: Option<PathBuf>) -> Self {
        let version = checkpoint.version();
        Self {
            model: checkpoint.model,
            version,
            source,
            metadata: checkpoint.metadata,
            loaded_at: Utc::now(),
        }
    }

    /// Wrap an in-memory model, e.g. straight out of training
    pub fn from_model(model: RecurrentRegressor, version: impl Into<String>) -> Self {
        Self {
            model,
            version: version.into(),
            source: None,
            metadata: None,
            loaded_at: Utc::now(),
        }
    }

    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let checkpoint = load_checkpoint(path, device)?;
        let loaded = Self::from_checkpoint(checkpoint, Some(path.to_path_buf()));
        StructuredLogger::new("predictor").log_model_loaded(
            loaded.model.kind().as_str(),
            &loaded.version,
            path,
            loaded.model.num_parameters(),
        );
        Ok(loaded)
    }
}

/// Swappable slot for the model used by every predictor sharing it
#[derive(Debug, Clone, Default)]
pub struct ModelHandle {
    slot: Arc<RwLock<Option<Arc<LoadedModel>>>>,
}

impl ModelHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_model(model: LoadedModel) -> Self {
        let handle = Self::empty();
        handle.replace(model);
        handle
    }

    /// The loaded model, or `ModelNotLoaded`
    pub fn current(&self) -> Result<Arc<LoadedModel>> {
        let slot = self.slot.read().unwrap_or_else(|p| p.into_inner());
        slot.clone().ok_or(ForecastError::ModelNotLoaded)
    }

    pub fn is_loaded(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Install a new model; in-flight predictions finish on the old one
    pub fn replace(&self, model: LoadedModel) -> Option<Arc<LoadedModel>> {
        let metrics = ForecastMetrics::new();
        metrics.set_model_info(model.model.kind().as_str(), &model.version);
        let mut slot = self.slot.write().unwrap_or_else(|p| p.into_inner());
        slot.replace(Arc::new(model))
    }

    pub fn clear(&self) -> Option<Arc<LoadedModel>> {
        ForecastMetrics::new().clear_model_info();
        self.slot.write().unwrap_or_else(|p| p.into_inner()).take()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub calibration: CongestionCalibration,
    pub confidence: ConfidenceMode,
    /// Default `target_time` offset from the prediction time
    pub target_offset_minutes: i64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            calibration: CongestionCalibration::default(),
            confidence: ConfidenceMode::default(),
            target_offset_minutes: 60,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> Result<()> {
        self.calibration.validate()?;
        self.confidence.validate()
    }
}

/// A prediction and what happened to its persistence side effect
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    #[serde(flatten)]
    pub result: PredictionResult,
    pub persistence: PersistStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InferenceStats {
    pub total_inferences: u64,
    pub slow_inferences: u64,
}

pub struct Predictor {
    handle: ModelHandle,
    config: PredictorConfig,
    persistence: Option<PersistenceQueue>,
    metrics: ForecastMetrics,
    logger: StructuredLogger,
    inference_count: AtomicU64,
    slow_inference_count: AtomicU64,
}

impl Predictor {
    pub fn new(
        handle: ModelHandle,
        config: PredictorConfig,
        persistence: Option<PersistenceQueue>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            handle,
            config,
            persistence,
            metrics: ForecastMetrics::new(),
            logger: StructuredLogger::new("predictor"),
            inference_count: AtomicU64::new(0),
            slow_inference_count: AtomicU64::new(0),
        })
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            total_inferences: self.inference_count.load(Ordering::Relaxed),
            slow_inferences: self.slow_inference_count.load(Ordering::Relaxed),
        }
    }

    /// Predict from one (lookback, features) window.
    ///
    /// With `persist`, a record is queued for the store; a failure to queue
    /// is reported in [`Prediction::persistence`], never as an error.
    pub fn predict(
        &self,
        window: ArrayView2<'_, f32>,
        sensor_id: Option<&str>,
        persist: bool,
        target_time: Option<DateTime<Utc>>,
    ) -> Result<Prediction> {
        let loaded = self.handle.current().inspect_err(|_| {
            self.metrics.inc_prediction_errors();
        })?;

        let mut results = self
            .run(&loaded, &[window], target_time)
            .inspect_err(|_| self.metrics.inc_prediction_errors())?;
        let mut result = results.remove(0);
        result.sensor_id = sensor_id.map(str::to_string);
        self.logger.log_prediction(&result);

        let persistence = if persist {
            self.enqueue(&result)
        } else {
            PersistStatus::NotRequested
        };
        Ok(Prediction {
            result,
            persistence,
        })
    }

    /// Predict every window in one forward pass. Windows must share a length.
    pub fn predict_batch(&self, windows: &[ArrayView2<'_, f32>]) -> Result<Vec<PredictionResult>> {
        if windows.is_empty() {
            return Ok(Vec::new());
        }
        let loaded = self.handle.current().inspect_err(|_| {
            self.metrics.inc_prediction_errors();
        })?;
        self.run(&loaded, windows, None)
            .inspect_err(|_| self.metrics.inc_prediction_errors())
    }

    fn run(
        &self,
        loaded: &LoadedModel,
        windows: &[ArrayView2<'_, f32>],
        target_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<PredictionResult>> {
        let start = Instant::now();
        let model = &loaded.model;
        let xs = windows_to_tensor(windows, model.config().input_size, model.device())?;

        let outputs = model.predict(&xs)?.to_vec2::<f32>()?;
        let confidences = self.config.confidence.estimate(model, &xs)?;

        let elapsed = start.elapsed();
        self.record_latency(elapsed);

        let prediction_time = Utc::now();
        let target_time = target_time.unwrap_or_else(|| {
            prediction_time + ChronoDuration::minutes(self.config.target_offset_minutes)
        });

        Ok(outputs
            .into_iter()
            .zip(confidences)
            .map(|(out, confidence)| {
                let flow = out.first().copied().unwrap_or(0.0);
                let density = out.get(1).copied().unwrap_or(0.0);
                let level = self.config.calibration.classify(density);
                PredictionResult {
                    sensor_id: None,
                    flow,
                    density,
                    speed: out.get(2).copied(),
                    congestion_status: level.code(),
                    congestion_level: level.label().to_string(),
                    confidence,
                    prediction_time,
                    target_time,
                    model_type: model.kind().as_str().to_string(),
                    model_version: loaded.version.clone(),
                }
            })
            .collect())
    }

    fn record_latency(&self, elapsed: std::time::Duration) {
        self.inference_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc_predictions();
        self.metrics.observe_prediction_latency(elapsed.as_secs_f64());
        if elapsed.as_millis() > SLOW_INFERENCE_MS {
            self.slow_inference_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Inference exceeded {}ms", SLOW_INFERENCE_MS
            );
        } else {
            debug!(elapsed_us = elapsed.as_micros() as u64, "Inference completed");
        }
    }

    fn enqueue(&self, result: &PredictionResult) -> PersistStatus {
        let Some(queue) = &self.persistence else {
            return PersistStatus::Rejected("persistence is disabled".to_string());
        };
        match PredictionRecord::from_result(result) {
            Some(record) => queue.submit(record),
            None => {
                let reason = "a sensor id is required to persist a prediction".to_string();
                self.logger.log_persistence_failed("-", &reason);
                PersistStatus::Rejected(reason)
            }
        }
    }
}

/// Stack (lookback, features) windows into a (batch, lookback, features) tensor
fn windows_to_tensor(windows: &[ArrayView2<'_, f32>], input_size: usize, device: &Device) -> Result<Tensor> {
    let (steps, features) = windows[0].dim();
    if steps == 0 || features != input_size {
        return Err(ForecastError::InvalidInput(format!(
            "window must have shape (lookback, {input_size}), got ({steps}, {features})"
        )));
    }

    let mut flat = Vec::with_capacity(windows.len() * steps * features);
    for (i, window) in windows.iter().enumerate() {
        if window.dim() != (steps, features) {
            return Err(ForecastError::InvalidInput(format!(
                "window {i} has shape {:?}, expected ({steps}, {features})",
                window.dim()
            )));
        }
        if window.iter().any(|v| !v.is_finite()) {
            return Err(ForecastError::InvalidInput(format!(
                "window {i} contains non-finite values"
            )));
        }
        flat.extend(window.iter().copied());
    }
    Ok(Tensor::from_vec(flat, (windows.len(), steps, features), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{save_checkpoint, ModelConfig, ModelKind};
    use crate::persistence::{MemoryStore, PersistenceConfig, PersistenceWorker};
    use ndarray::Array2;
    use tempfile::TempDir;

    fn tiny_model(kind: ModelKind) -> RecurrentRegressor {
        let config = ModelConfig {
            model_type: kind,
            hidden_size: 4,
            num_layers: 1,
            ..Default::default()
        };
        RecurrentRegressor::new(config, &Device::Cpu).unwrap()
    }

    fn window() -> Array2<f32> {
        Array2::from_shape_fn((12, 3), |(t, f)| (t as f32 * 0.05) + f as f32 * 0.1)
    }

    #[test]
    fn test_no_model_is_distinct_error() {
        let predictor =
            Predictor::new(ModelHandle::empty(), PredictorConfig::default(), None).unwrap();
        let err = predictor
            .predict(window().view(), Some("sensor_001"), false, None)
            .unwrap_err();
        assert!(matches!(err, ForecastError::ModelNotLoaded));
        assert!(err.is_retryable_after_setup());
    }

    #[test]
    fn test_prediction_fields() {
        let handle = ModelHandle::with_model(LoadedModel::from_model(tiny_model(ModelKind::Lstm), "test-v1"));
        let predictor = Predictor::new(handle, PredictorConfig::default(), None).unwrap();

        let target = Utc::now() + ChronoDuration::hours(2);
        let prediction = predictor
            .predict(window().view(), Some("sensor_042"), false, Some(target))
            .unwrap();
        let result = &prediction.result;

        assert_eq!(result.sensor_id.as_deref(), Some("sensor_042"));
        assert_eq!(result.target_time, target);
        assert_eq!(result.model_type, "lstm");
        assert_eq!(result.model_version, "test-v1");
        assert_eq!(result.confidence, 0.85);
        assert!(result.speed.is_some());
        let expected = CongestionCalibration::default().classify(result.density);
        assert_eq!(result.congestion_status, expected.code());
        assert_eq!(result.congestion_level, expected.label());
        assert_eq!(prediction.persistence, PersistStatus::NotRequested);
        assert_eq!(predictor.stats().total_inferences, 1);
    }

    #[test]
    fn test_concurrent_predictions_share_model() {
        for kind in [ModelKind::Lstm, ModelKind::Gru] {
            let handle = ModelHandle::with_model(LoadedModel::from_model(tiny_model(kind), "v"));
            let predictor = Predictor::new(handle, PredictorConfig::default(), None).unwrap();
            let input = window();
            let expected = predictor.predict(input.view(), None, false, None).unwrap().result;

            let outputs: Vec<(f32, f32, Option<f32>)> = std::thread::scope(|scope| {
                let workers: Vec<_> = (0..8)
                    .map(|_| {
                        scope.spawn(|| {
                            let r = predictor.predict(input.view(), None, false, None).unwrap().result;
                            (r.flow, r.density, r.speed)
                        })
                    })
                    .collect();
                workers.into_iter().map(|w| w.join().unwrap()).collect()
            });

            for output in outputs {
                assert_eq!(output, (expected.flow, expected.density, expected.speed));
            }
            assert_eq!(predictor.stats().total_inferences, 9);
        }
    }

    #[test]
    fn test_malformed_window() {
        let handle = ModelHandle::with_model(LoadedModel::from_model(tiny_model(ModelKind::Gru), "v"));
        let predictor = Predictor::new(handle, PredictorConfig::default(), None).unwrap();

        let wrong_width = Array2::<f32>::zeros((12, 4));
        assert!(matches!(
            predictor.predict(wrong_width.view(), None, false, None),
            Err(ForecastError::InvalidInput(_))
        ));
        let mut nan = window();
        nan[[3, 1]] = f32::NAN;
        assert!(matches!(
            predictor.predict(nan.view(), None, false, None),
            Err(ForecastError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_batch_matches_single() {
        let handle = ModelHandle::with_model(LoadedModel::from_model(tiny_model(ModelKind::Gru), "v"));
        let predictor = Predictor::new(handle, PredictorConfig::default(), None).unwrap();

        let a = window();
        let b = window().mapv(|v| v * 2.0);
        let batch = predictor.predict_batch(&[a.view(), b.view()]).unwrap();
        assert_eq!(batch.len(), 2);

        let single = predictor.predict(b.view(), None, false, None).unwrap();
        assert!((batch[1].flow - single.result.flow).abs() < 1e-5);
        assert!((batch[1].density - single.result.density).abs() < 1e-5);

        let short = Array2::<f32>::zeros((6, 3));
        assert!(predictor.predict_batch(&[a.view(), short.view()]).is_err());
    }

    #[test]
    fn test_handle_swap_changes_version() {
        let handle = ModelHandle::with_model(LoadedModel::from_model(tiny_model(ModelKind::Lstm), "first"));
        let predictor = Predictor::new(handle.clone(), PredictorConfig::default(), None).unwrap();
        let before = predictor.predict(window().view(), None, false, None).unwrap();

        let previous = handle.replace(LoadedModel::from_model(tiny_model(ModelKind::Gru), "second"));
        assert_eq!(previous.unwrap().version, "first");
        let after = predictor.predict(window().view(), None, false, None).unwrap();

        assert_eq!(before.result.model_version, "first");
        assert_eq!(after.result.model_version, "second");
        assert_eq!(after.result.model_type, "gru");

        handle.clear();
        assert!(!handle.is_loaded());
    }

    #[test]
    fn test_loads_checkpoint_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        save_checkpoint(&tiny_model(ModelKind::Lstm), None, &path).unwrap();

        let loaded = LoadedModel::load(&path, &Device::Cpu).unwrap();
        assert!(loaded.version.starts_with("lstm-"));
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_fail_prediction() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let (queue, worker) =
            PersistenceWorker::spawn(store.clone(), &PersistenceConfig::default(), None);

        let handle = ModelHandle::with_model(LoadedModel::from_model(tiny_model(ModelKind::Lstm), "v"));
        let predictor = Predictor::new(handle, PredictorConfig::default(), Some(queue)).unwrap();

        let prediction = predictor
            .predict(window().view(), Some("sensor_001"), true, None)
            .unwrap();
        assert_eq!(prediction.persistence, PersistStatus::Queued);

        // Without a sensor id there is nothing to key the record on
        let anonymous = predictor.predict(window().view(), None, true, None).unwrap();
        assert!(matches!(anonymous.persistence, PersistStatus::Rejected(_)));

        drop(predictor);
        let stats = worker.shutdown(std::time::Duration::from_secs(5)).await;
        assert_eq!(stats.failed, 1);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_record_contents() {
        let store = Arc::new(MemoryStore::new());
        let (queue, worker) =
            PersistenceWorker::spawn(store.clone(), &PersistenceConfig::default(), None);
        let handle = ModelHandle::with_model(LoadedModel::from_model(tiny_model(ModelKind::Gru), "gru-v3"));
        let predictor = Predictor::new(handle, PredictorConfig::default(), Some(queue)).unwrap();

        let prediction = predictor
            .predict(window().view(), Some("sensor_007"), true, None)
            .unwrap();
        drop(predictor);
        worker.shutdown(std::time::Duration::from_secs(5)).await;

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sensor_id, "sensor_007");
        assert_eq!(records[0].congestion_prediction, prediction.result.congestion_level);
        assert_eq!(records[0].model_version, "gru-v3");
    }
}
