//! Training and offline evaluation commands

use anyhow::{Context, Result};
use candle_core::Device;
use forecast_lib::data::{
    split_chronological, DatasetConfig, Preprocessor, RawSeries, SplitRatios, WindowedDataset,
};
use forecast_lib::model::{load_checkpoint, ModelKind, RecurrentRegressor};
use forecast_lib::training::{EvaluationReport, Evaluator, Trainer, TrainingRecord};
use forecast_lib::{ForecastError, Feature, NUM_FEATURES};
use ndarray::{Array3, Axis};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tabled::Tabled;
use tracing::{info, warn};

use crate::config::CliConfig;
use crate::output::{
    color_status, format_float, print_field, print_heading, print_info, print_json, print_success,
    print_table, print_warning, OutputFormat,
};

/// File the fitted scalers are written to, next to `best/`
pub const SCALERS_FILE: &str = "scalers.json";

/// Chronological train/validation/test windows
pub struct Splits {
    pub train: WindowedDataset,
    pub val: WindowedDataset,
    /// `None` when the test ratio leaves no timesteps
    pub test: Option<WindowedDataset>,
}

impl Splits {
    pub fn num_features(&self) -> usize {
        self.train.num_features()
    }
}

/// Split a scaled (timestep, sensor, feature) array by time and window each part
pub fn build_splits(data: &Array3<f32>, dataset: &DatasetConfig, ratios: SplitRatios) -> Result<Splits> {
    let (train, val, test) = split_chronological(data, ratios)?;
    let window = |part: Array3<f32>, name: &str| -> Result<WindowedDataset> {
        let built = if dataset.simplified {
            let mean = part
                .mean_axis(Axis(1))
                .ok_or_else(|| ForecastError::config("series has no sensors"))?;
            WindowedDataset::from_config(mean, dataset)
        } else {
            WindowedDataset::from_series(part, dataset.lookback, dataset.target_mode(), dataset.stride)
        };
        built.with_context(|| format!("Cannot build the {name} split"))
    };

    let test = if test.len_of(Axis(0)) > 0 {
        Some(window(test, "test")?)
    } else {
        None
    };
    Ok(Splits {
        train: window(train, "train")?,
        val: window(val, "validation")?,
        test,
    })
}

/// Load, preprocess and window a dataset; also returns the fitted scalers
fn prepare(data_path: &Path, config: &CliConfig) -> Result<(Splits, forecast_lib::data::FittedScalers)> {
    let raw = RawSeries::load(data_path)
        .with_context(|| format!("Failed to load dataset from {}", data_path.display()))?;
    let info = raw.info();
    info!(
        timesteps = info.num_timesteps,
        sensors = info.num_sensors,
        "Loaded raw series"
    );

    let processed = Preprocessor::new(config.preprocess.clone())?.process(&raw)?;
    let splits = build_splits(&processed.data, &config.dataset, config.split)?;
    Ok((splits, processed.scalers))
}

pub struct TrainArgs {
    pub data: PathBuf,
    pub model: Option<ModelKind>,
    pub epochs: Option<usize>,
    pub out: Option<PathBuf>,
}

/// Train a model and write its best checkpoint, scalers and run record
pub async fn train(args: TrainArgs, mut config: CliConfig, format: OutputFormat) -> Result<()> {
    if let Some(kind) = args.model {
        config.model.model_type = kind;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(out) = args.out {
        config.training.output_dir = out;
    }

    let (splits, scalers) = prepare(&args.data, &config)?;
    let scaler_path = config.training.output_dir.join(SCALERS_FILE);
    scalers
        .save(&scaler_path)
        .with_context(|| format!("Failed to write {}", scaler_path.display()))?;

    config.model.input_size = splits.num_features();
    config.model.output_size = splits.num_features();
    let model = RecurrentRegressor::new(config.model.clone(), &Device::Cpu)?;
    let mut trainer = Trainer::new(model, config.training.clone())?;

    // Ctrl-C stops after the current batch; the best checkpoint is kept
    let cancel = trainer.cancellation_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping training");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    if format == OutputFormat::Table {
        print_info(&format!(
            "Training {} on {} windows ({} validation)",
            config.model.model_type.display_name(),
            splits.train.len(),
            splits.val.len()
        ));
    }
    let record = tokio::task::spawn_blocking(move || {
        trainer.run(&splits.train, &splits.val, splits.test.as_ref())
    })
    .await
    .context("Training task failed")??;

    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Table => {
            print_record(&record);
            print_field("Scalers", scaler_path.display());
        }
    }
    Ok(())
}

fn print_record(record: &TrainingRecord) {
    print_heading("Training Run");
    print_field("Model", &record.model_name);
    print_field("Version", &record.model_version);
    let status = serde_json::to_value(record.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_lowercase))
        .unwrap_or_default();
    print_field("Status", color_status(&status));
    print_field("Epochs run", record.epochs_run);
    print_field("Duration", format!("{:.1}s", record.duration_seconds));
    if let (Some(loss), Some(epoch)) = (record.best_val_loss, record.best_epoch) {
        print_field("Best val loss", format!("{} (epoch {epoch})", format_float(loss)));
    }
    if let (Some(mae), Some(rmse), Some(mape)) = (record.mae, record.rmse, record.mape) {
        print_field("Test MAE", format_float(mae));
        print_field("Test RMSE", format_float(rmse));
        print_field("Test MAPE", format!("{:.2}%", mape));
    }
    match &record.checkpoint_path {
        Some(path) => print_success(&format!("Best checkpoint: {}", path.display())),
        None => print_warning("No checkpoint was written"),
    }
}

/// Row for per-output metrics table
#[derive(Tabled)]
struct MetricsRow {
    #[tabled(rename = "Output")]
    output: String,
    #[tabled(rename = "MAE")]
    mae: String,
    #[tabled(rename = "RMSE")]
    rmse: String,
    #[tabled(rename = "MAPE")]
    mape: String,
}

fn output_name(index: usize, outputs: usize) -> String {
    if outputs == NUM_FEATURES {
        Feature::ALL[index].name().to_string()
    } else {
        format!("output_{index}")
    }
}

/// Evaluate a checkpoint on the held-out test split
pub async fn evaluate(data: &Path, checkpoint: &Path, config: CliConfig, format: OutputFormat) -> Result<()> {
    let loaded = load_checkpoint(checkpoint, &Device::Cpu)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    let (splits, _) = prepare(data, &config)?;
    let test = splits
        .test
        .context("The configured split leaves no test data")?;
    if test.num_features() != loaded.model.config().input_size {
        anyhow::bail!(
            "Checkpoint expects {} features per step but the dataset yields {}; check dataset.simplified",
            loaded.model.config().input_size,
            test.num_features()
        );
    }

    let report = Evaluator::new(&loaded.model, config.training.batch_size).evaluate(&test)?;
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => print_report(&report, &loaded.version()),
    }
    Ok(())
}

fn print_report(report: &EvaluationReport, version: &str) {
    print_heading("Evaluation");
    print_field("Model version", version);
    print_field("Test windows", report.num_samples);
    println!();

    let outputs = report.per_output.len();
    let mut rows: Vec<MetricsRow> = report
        .per_output
        .iter()
        .enumerate()
        .map(|(i, m)| MetricsRow {
            output: output_name(i, outputs),
            mae: format_float(m.mae),
            rmse: format_float(m.rmse),
            mape: format!("{:.2}%", m.mape),
        })
        .collect();
    rows.push(MetricsRow {
        output: "overall".to_string(),
        mae: format_float(report.overall.mae),
        rmse: format_float(report.overall.rmse),
        mape: format!("{:.2}%", report.overall.mape),
    });
    print_table(&rows);
}

#[cfg(test)]
mod tests {
    use super::*;
    use forecast_lib::data::TargetMode;

    fn series(t: usize, s: usize) -> Array3<f32> {
        Array3::from_shape_fn((t, s, 3), |(t, s, f)| (t * 10 + s + f) as f32)
    }

    #[test]
    fn test_simplified_splits_average_sensors() {
        let dataset = DatasetConfig {
            lookback: 4,
            simplified: true,
            ..Default::default()
        };
        let splits = build_splits(&series(100, 2), &dataset, SplitRatios::default()).unwrap();

        assert_eq!(splits.num_features(), 3);
        assert_eq!(splits.train.mode(), TargetMode::NextStep);
        // 70 train steps, lookback 4, one target step
        assert_eq!(splits.train.len(), 66);
        assert_eq!(splits.val.len(), 6);
        assert_eq!(splits.test.as_ref().unwrap().len(), 16);

        // Mean of sensors 0 and 1 at t=0, flow: (0 + 1) / 2
        let first = splits.train.get(0).unwrap();
        assert_eq!(first.input[[0, 0]], 0.5);
    }

    #[test]
    fn test_full_splits_flatten_sensors() {
        let dataset = DatasetConfig {
            lookback: 4,
            horizon: 2,
            simplified: false,
            ..Default::default()
        };
        let splits = build_splits(&series(100, 2), &dataset, SplitRatios::default()).unwrap();
        assert_eq!(splits.num_features(), 6);
        assert_eq!(splits.train.mode(), TargetMode::Horizon(2));
    }

    #[test]
    fn test_no_test_split() {
        let ratios = SplitRatios { train: 0.8, val: 0.2 };
        let splits = build_splits(&series(100, 1), &DatasetConfig::default(), ratios).unwrap();
        assert!(splits.test.is_none());
    }

    #[test]
    fn test_short_split_is_error() {
        let dataset = DatasetConfig {
            lookback: 12,
            ..Default::default()
        };
        // 10% of 60 steps cannot hold a 13-step window
        assert!(build_splits(&series(60, 1), &dataset, SplitRatios::default()).is_err());
    }

    #[test]
    fn test_output_names() {
        assert_eq!(output_name(1, 3), "occupancy");
        assert_eq!(output_name(4, 6), "output_4");
    }
}
