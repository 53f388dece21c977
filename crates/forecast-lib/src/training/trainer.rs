//! Supervised training loop
//!
//! Each epoch runs a shuffled pass over the training split, an ordered pass
//! over the validation split, writes the `best` checkpoint when validation
//! loss improves and then consults early stopping. A non-finite loss ends the
//! run as `Failed` before anything further is checkpointed.

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::early_stopping::{EarlyStopping, PlateauConfig, PlateauScheduler, StopDecision};
use super::metrics::{EvaluationReport, Evaluator};
use crate::data::WindowedDataset;
use crate::error::{ForecastError, Result};
use crate::model::{
    best_checkpoint_path, epoch_checkpoint_path, load_checkpoint, save_checkpoint, RecurrentRegressor,
    SavedCheckpoint, TrainingMetadata,
};
use crate::observability::{ForecastMetrics, StructuredLogger};

/// File under the output directory that collects one JSON record per run
pub const TRAINING_RECORDS_FILE: &str = "training_records.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub early_stopping_patience: usize,
    pub min_delta: f64,
    pub plateau: PlateauConfig,
    /// Root for `best/`, `checkpoints/` and the run log
    pub output_dir: PathBuf,
    /// Also write a checkpoint every N epochs
    pub checkpoint_every: Option<usize>,
    pub shuffle_seed: u64,
    pub model_version: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 64,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
            early_stopping_patience: 10,
            min_delta: 0.0,
            plateau: PlateauConfig::default(),
            output_dir: PathBuf::from("models"),
            checkpoint_every: None,
            shuffle_seed: 42,
            model_version: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(ForecastError::config("epochs and batch_size must be positive"));
        }
        if !(self.learning_rate > 0.0) || self.weight_decay < 0.0 {
            return Err(ForecastError::config(
                "learning_rate must be positive and weight_decay non-negative",
            ));
        }
        if self.early_stopping_patience == 0 {
            return Err(ForecastError::config("early_stopping_patience must be at least 1"));
        }
        if self.checkpoint_every == Some(0) {
            return Err(ForecastError::config("checkpoint_every must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Initialized,
    Running,
    Completed,
    StoppedEarly,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Initialized | RunStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub improved: bool,
}

/// Result of [`Trainer::fit`]
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub status: RunStatus,
    pub history: Vec<EpochStats>,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub best_checkpoint: Option<SavedCheckpoint>,
}

/// One line of `training_records.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub model_name: String,
    pub model_version: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub epochs_run: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub optimizer: String,
    pub final_train_loss: Option<f64>,
    pub final_val_loss: Option<f64>,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub mape: Option<f64>,
    pub checkpoint_path: Option<PathBuf>,
    pub checkpoint_sha256: Option<String>,
    pub status: RunStatus,
    pub config_json: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append a record as one JSON line
pub fn append_training_record(dir: impl AsRef<Path>, record: &TrainingRecord) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let path = dir.join(TRAINING_RECORDS_FILE);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(path)
}

/// Read back every record in the run log
pub fn read_training_records(dir: impl AsRef<Path>) -> Result<Vec<TrainingRecord>> {
    let path = dir.as_ref().join(TRAINING_RECORDS_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    std::fs::read_to_string(&path)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(ForecastError::from))
        .collect()
}

pub struct Trainer {
    model: RecurrentRegressor,
    config: TrainingConfig,
    cancel: Arc<AtomicBool>,
    metrics: ForecastMetrics,
    logger: StructuredLogger,
    status: RunStatus,
}

impl Trainer {
    pub fn new(model: RecurrentRegressor, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            metrics: ForecastMetrics::new(),
            logger: StructuredLogger::new("trainer"),
            status: RunStatus::Initialized,
        })
    }

    /// Share an external flag; setting it interrupts the run between batches
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn model(&self) -> &RecurrentRegressor {
        &self.model
    }

    pub fn into_model(self) -> RecurrentRegressor {
        self.model
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn check_dataset(&self, dataset: &WindowedDataset, split: &str) -> Result<()> {
        let model = self.model.config();
        if dataset.num_features() != model.input_size || dataset.num_features() != model.output_size {
            return Err(ForecastError::config(format!(
                "{split} split has {} features per step, model expects input {} and output {}",
                dataset.num_features(),
                model.input_size,
                model.output_size
            )));
        }
        if dataset.is_empty() {
            return Err(ForecastError::config(format!("{split} split has no samples")));
        }
        Ok(())
    }

    /// Train until the epoch budget, early stopping, interruption or failure
    pub fn fit(&mut self, train: &WindowedDataset, val: &WindowedDataset) -> Result<FitSummary> {
        self.check_dataset(train, "train")?;
        self.check_dataset(val, "validation")?;

        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(self.model.vars(), params)?;
        let mut stopper = EarlyStopping::new(self.config.early_stopping_patience, self.config.min_delta);
        let mut scheduler = PlateauScheduler::new(self.config.learning_rate, self.config.plateau.clone());
        let best_path = best_checkpoint_path(&self.config.output_dir, self.model.kind());

        let mut summary = FitSummary {
            status: RunStatus::Running,
            history: Vec::new(),
            best_val_loss: None,
            best_epoch: None,
            best_checkpoint: None,
        };
        self.status = RunStatus::Running;
        info!(
            model_type = %self.model.kind(),
            parameters = self.model.num_parameters(),
            train_samples = train.len(),
            val_samples = val.len(),
            epochs = self.config.epochs,
            "Starting training"
        );

        for epoch in 1..=self.config.epochs {
            let started = Instant::now();
            let train_loss = match self.train_epoch(train, &mut optimizer, epoch)? {
                Some(loss) => loss,
                None => {
                    summary.status = RunStatus::Interrupted;
                    break;
                }
            };
            let val_loss = self.validate(val, epoch)?;
            let lr = optimizer.learning_rate();

            let decision = stopper.step(epoch, val_loss);
            let improved = decision == StopDecision::Improved;
            if improved {
                let meta = self.metadata(epoch, train_loss, val_loss, lr, "best");
                let saved = save_checkpoint(&self.model, Some(&meta), &best_path)?;
                self.logger.log_checkpoint_saved(&saved, "best", epoch);
                summary.best_val_loss = Some(val_loss);
                summary.best_epoch = Some(epoch);
                summary.best_checkpoint = Some(saved);
            }
            if let Some(every) = self.config.checkpoint_every {
                if epoch % every == 0 {
                    let meta = self.metadata(epoch, train_loss, val_loss, lr, "periodic");
                    let path = epoch_checkpoint_path(&self.config.output_dir, self.model.kind(), epoch);
                    let saved = save_checkpoint(&self.model, Some(&meta), &path)?;
                    self.logger.log_checkpoint_saved(&saved, "periodic", epoch);
                }
            }

            self.metrics.inc_training_epochs();
            self.metrics.set_last_val_loss(val_loss);
            self.logger
                .log_epoch(epoch, train_loss, val_loss, lr, started.elapsed().as_secs_f64());
            summary.history.push(EpochStats {
                epoch,
                train_loss,
                val_loss,
                learning_rate: lr,
                improved,
            });

            if decision == StopDecision::Stop {
                info!(
                    epoch = epoch,
                    best_epoch = stopper.best_epoch(),
                    "Early stopping: no improvement for {} epochs",
                    self.config.early_stopping_patience
                );
                summary.status = RunStatus::StoppedEarly;
                break;
            }
            if let Some(new_lr) = scheduler.step(val_loss) {
                info!(epoch = epoch, learning_rate = new_lr, "Reduced learning rate on plateau");
                optimizer.set_learning_rate(new_lr);
            }
            if self.cancelled() {
                summary.status = RunStatus::Interrupted;
                break;
            }
        }

        if summary.status == RunStatus::Running {
            summary.status = RunStatus::Completed;
        }
        if summary.status == RunStatus::Interrupted {
            warn!(
                epochs_run = summary.history.len(),
                "Training interrupted; best checkpoint left as is"
            );
        }
        self.status = summary.status;
        Ok(summary)
    }

    /// Returns `None` when interrupted
    fn train_epoch(&self, train: &WindowedDataset, optimizer: &mut AdamW, epoch: usize) -> Result<Option<f64>> {
        let seed = self.config.shuffle_seed.wrapping_add(epoch as u64);
        let mut total = 0.0;
        let mut count = 0usize;
        for (batch_idx, batch) in train
            .batches(self.config.batch_size, Some(seed), self.model.device())
            .enumerate()
        {
            if self.cancelled() {
                return Ok(None);
            }
            let (x, y) = batch?;
            let pred = self.model.forward(&x, true)?;
            let loss = candle_nn::loss::mse(&pred, &y)?;
            let value = loss.to_scalar::<f32>()? as f64;
            if !value.is_finite() {
                return Err(ForecastError::Numerical(format!(
                    "training loss is {value} at epoch {epoch}, batch {batch_idx}"
                )));
            }
            optimizer.backward_step(&loss)?;
            let n = x.dim(0)?;
            total += value * n as f64;
            count += n;
        }
        Ok(Some(total / count.max(1) as f64))
    }

    fn validate(&self, val: &WindowedDataset, epoch: usize) -> Result<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in val.batches(self.config.batch_size, None, self.model.device()) {
            let (x, y) = batch?;
            let pred = self.model.forward(&x, false)?;
            let value = candle_nn::loss::mse(&pred, &y)?.to_scalar::<f32>()? as f64;
            if !value.is_finite() {
                return Err(ForecastError::Numerical(format!(
                    "validation loss is {value} at epoch {epoch}"
                )));
            }
            let n = x.dim(0)?;
            total += value * n as f64;
            count += n;
        }
        debug!(epoch = epoch, val_loss = total / count.max(1) as f64, "Validation pass");
        Ok(total / count.max(1) as f64)
    }

    fn metadata(&self, epoch: usize, train_loss: f64, val_loss: f64, lr: f64, tag: &str) -> TrainingMetadata {
        TrainingMetadata {
            epoch,
            train_loss,
            val_loss,
            learning_rate: lr,
            saved_at: Utc::now(),
            tag: tag.to_string(),
        }
    }

    /// Load the weights of the best checkpoint back into the in-memory model
    pub fn restore_best(&self, summary: &FitSummary) -> Result<()> {
        if let Some(saved) = &summary.best_checkpoint {
            let loaded = load_checkpoint(&saved.path, self.model.device())?;
            self.model.load_tensors(&loaded.model.named_tensors()?.into_iter().collect())?;
        }
        Ok(())
    }

    /// Fit, evaluate the best weights on `test`, and append a run record
    pub fn run(
        &mut self,
        train: &WindowedDataset,
        val: &WindowedDataset,
        test: Option<&WindowedDataset>,
    ) -> Result<TrainingRecord> {
        let start_time = Utc::now();
        let started = Instant::now();

        let outcome = self.fit(train, val).and_then(|summary| {
            self.restore_best(&summary)?;
            let report = match test {
                Some(test) if !test.is_empty() => {
                    Some(Evaluator::new(&self.model, self.config.batch_size).evaluate(test)?)
                }
                _ => None,
            };
            Ok((summary, report))
        });

        let (summary, report, error) = match outcome {
            Ok((summary, report)) => (Some(summary), report, None),
            Err(e @ ForecastError::Numerical(_)) => {
                self.status = RunStatus::Failed;
                (None, None, Some(e))
            }
            Err(e) => {
                self.status = RunStatus::Failed;
                return Err(e);
            }
        };

        let record = self.record(start_time, started, summary.as_ref(), report.as_ref(), &error);
        append_training_record(&self.config.output_dir, &record)?;
        self.logger.log_training_finished(&record);

        match error {
            Some(e) => Err(e),
            None => Ok(record),
        }
    }

    fn record(
        &self,
        start_time: DateTime<Utc>,
        started: Instant,
        summary: Option<&FitSummary>,
        report: Option<&EvaluationReport>,
        error: &Option<ForecastError>,
    ) -> TrainingRecord {
        let last = summary.and_then(|s| s.history.last());
        let best = summary.and_then(|s| s.best_checkpoint.as_ref());
        let kind = self.model.kind();
        TrainingRecord {
            model_name: kind.display_name().to_string(),
            model_version: self
                .config
                .model_version
                .clone()
                .unwrap_or_else(|| format!("{kind}-{}", start_time.format("%Y%m%d%H%M%S"))),
            start_time,
            end_time: Utc::now(),
            duration_seconds: started.elapsed().as_secs_f64(),
            epochs_run: summary.map(|s| s.history.len()).unwrap_or(0),
            batch_size: self.config.batch_size,
            learning_rate: self.config.learning_rate,
            optimizer: "AdamW".to_string(),
            final_train_loss: last.map(|e| e.train_loss),
            final_val_loss: last.map(|e| e.val_loss),
            best_val_loss: summary.and_then(|s| s.best_val_loss),
            best_epoch: summary.and_then(|s| s.best_epoch),
            mae: report.map(|r| r.overall.mae),
            rmse: report.map(|r| r.overall.rmse),
            mape: report.map(|r| r.overall.mape),
            checkpoint_path: best.map(|b| b.path.clone()),
            checkpoint_sha256: best.map(|b| b.sha256.clone()),
            status: self.status,
            config_json: serde_json::json!({
                "model": self.model.config(),
                "training": &self.config,
            }),
            error: error.as_ref().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TargetMode;
    use crate::model::{ModelConfig, ModelKind};
    use candle_core::Device;
    use ndarray::Array2;

    fn tiny_model(kind: ModelKind) -> RecurrentRegressor {
        let config = ModelConfig {
            model_type: kind,
            hidden_size: 4,
            num_layers: 1,
            dropout: 0.0,
            ..Default::default()
        };
        RecurrentRegressor::new(config, &Device::Cpu).unwrap()
    }

    fn wave(len: usize) -> WindowedDataset {
        let data = Array2::from_shape_fn((len, 3), |(t, f)| {
            (((t as f32) * 0.3 + f as f32).sin() + 1.0) / 2.0
        });
        WindowedDataset::new(data, 6, TargetMode::NextStep, 1).unwrap()
    }

    fn config(dir: &Path, epochs: usize) -> TrainingConfig {
        TrainingConfig {
            epochs,
            batch_size: 16,
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_run_writes_best_checkpoint_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_model(ModelKind::Gru), config(dir.path(), 2)).unwrap();
        let record = trainer.run(&wave(60), &wave(30), Some(&wave(30))).unwrap();

        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.epochs_run, 2);
        assert_eq!(record.model_name, "GRU");
        assert!(record.mae.is_some());
        let best = record.checkpoint_path.clone().unwrap();
        assert_eq!(best, best_checkpoint_path(dir.path(), ModelKind::Gru));
        assert!(best.exists());

        let records = read_training_records(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model_version, record.model_version);
        assert_eq!(records[0].checkpoint_sha256, record.checkpoint_sha256);
        assert_eq!(records[0].status, RunStatus::Completed);
    }

    #[test]
    fn test_periodic_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrainingConfig {
            checkpoint_every: Some(1),
            ..config(dir.path(), 2)
        };
        let mut trainer = Trainer::new(tiny_model(ModelKind::Lstm), cfg).unwrap();
        trainer.fit(&wave(40), &wave(20)).unwrap();
        assert!(epoch_checkpoint_path(dir.path(), ModelKind::Lstm, 1).exists());
        assert!(epoch_checkpoint_path(dir.path(), ModelKind::Lstm, 2).exists());
    }

    #[test]
    fn test_cancelled_run_is_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let mut trainer = Trainer::new(tiny_model(ModelKind::Lstm), config(dir.path(), 5))
            .unwrap()
            .with_cancellation(flag);
        let summary = trainer.fit(&wave(40), &wave(20)).unwrap();
        assert_eq!(summary.status, RunStatus::Interrupted);
        assert!(summary.history.is_empty());
        assert!(summary.best_checkpoint.is_none());
        assert_eq!(trainer.status(), RunStatus::Interrupted);
    }

    #[test]
    fn test_non_finite_loss_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = Array2::<f32>::zeros((30, 3));
        data[[20, 0]] = f32::NAN;
        let train = WindowedDataset::new(data, 6, TargetMode::NextStep, 1).unwrap();

        let mut trainer = Trainer::new(tiny_model(ModelKind::Gru), config(dir.path(), 3)).unwrap();
        let err = trainer.run(&train, &wave(20), None).unwrap_err();
        assert!(matches!(err, ForecastError::Numerical(_)));
        assert_eq!(trainer.status(), RunStatus::Failed);
        assert!(!best_checkpoint_path(dir.path(), ModelKind::Gru).exists());

        let records = read_training_records(dir.path()).unwrap();
        assert_eq!(records[0].status, RunStatus::Failed);
        assert!(records[0].error.is_some());
    }

    #[test]
    fn test_dataset_width_must_match_model() {
        let dir = tempfile::tempdir().unwrap();
        let wide = WindowedDataset::new(Array2::zeros((30, 5)), 6, TargetMode::NextStep, 1).unwrap();
        let mut trainer = Trainer::new(tiny_model(ModelKind::Lstm), config(dir.path(), 1)).unwrap();
        assert!(matches!(
            trainer.fit(&wide, &wave(20)),
            Err(ForecastError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_training_config() {
        let cfg = TrainingConfig {
            epochs: 0,
            ..Default::default()
        };
        assert!(Trainer::new(tiny_model(ModelKind::Lstm), cfg).is_err());
    }
}
