//! Local inference and dataset inspection

use anyhow::{Context, Result};
use candle_core::Device;
use forecast_lib::predictor::{
    LoadedModel, ModelHandle, Predictor, SamplerConfig, SamplingMode, SensorSample, SensorSampler,
};
use forecast_lib::{format_sensor_id, Feature, SensorStatistics};
use serde::Serialize;
use std::path::PathBuf;
use tabled::Tabled;

use crate::config::CliConfig;
use crate::output::{
    color_confidence, color_congestion, format_float, print_field, print_heading, print_json,
    print_table, print_warning, OutputFormat,
};

pub struct SampleArgs {
    pub data: PathBuf,
    pub scalers: Option<PathBuf>,
    pub sensor: Option<String>,
    pub lookback: Option<usize>,
    pub seed: Option<u64>,
}

impl SampleArgs {
    fn sampler_config(&self, config: &CliConfig) -> SamplerConfig {
        SamplerConfig {
            data_path: self.data.clone(),
            scaler_path: self.scalers.clone(),
            lookback: self.lookback.unwrap_or(config.dataset.lookback),
            sampling: match self.seed {
                Some(seed) => SamplingMode::Seeded { seed },
                None => SamplingMode::Random,
            },
        }
    }
}

fn open_sampler(config: &SamplerConfig) -> Result<SensorSampler> {
    SensorSampler::open(config)
        .with_context(|| format!("Failed to open dataset {}", config.data_path.display()))
}

/// Row for a sampled window
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: usize,
    #[tabled(rename = "Flow")]
    flow: String,
    #[tabled(rename = "Occupancy")]
    occupancy: String,
    #[tabled(rename = "Speed")]
    speed: String,
}

fn step_rows(sample: &SensorSample) -> Vec<StepRow> {
    sample
        .window
        .outer_iter()
        .enumerate()
        .map(|(i, row)| StepRow {
            step: sample.time_index + i,
            flow: format_float(row[Feature::Flow.index()] as f64),
            occupancy: format_float(row[Feature::Occupancy.index()] as f64),
            speed: format_float(row[Feature::Speed.index()] as f64),
        })
        .collect()
}

#[derive(Serialize)]
struct SampleOutput {
    sensor_id: String,
    sensor_index: usize,
    time_index: usize,
    scaled: bool,
    window: Vec<Vec<f32>>,
}

/// Draw one sensor window from the dataset
pub async fn sample(args: SampleArgs, config: CliConfig, format: OutputFormat) -> Result<()> {
    let sampler_config = args.sampler_config(&config);
    let sampler = open_sampler(&sampler_config)?;
    let sample = sampler.sample_sequence(sampler_config.lookback, args.sensor.as_deref())?;

    match format {
        OutputFormat::Json => print_json(&SampleOutput {
            sensor_id: format_sensor_id(sample.sensor_index),
            sensor_index: sample.sensor_index,
            time_index: sample.time_index,
            scaled: sampler.scalers().is_some(),
            window: sample.window.outer_iter().map(|r| r.to_vec()).collect(),
        })?,
        OutputFormat::Table => {
            print_heading("Sensor Window");
            print_field("Sensor", format_sensor_id(sample.sensor_index));
            print_field("Start step", sample.time_index);
            print_field("Scaled", sampler.scalers().is_some());
            println!();
            print_table(&step_rows(&sample));
        }
    }
    Ok(())
}

/// Sample a window and run the checkpoint on it
pub async fn predict(
    args: SampleArgs,
    checkpoint: PathBuf,
    config: CliConfig,
    format: OutputFormat,
) -> Result<()> {
    let loaded = LoadedModel::load(&checkpoint, &Device::Cpu)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    let sampler_config = args.sampler_config(&config);
    let sampler = open_sampler(&sampler_config)?;
    let predictor = Predictor::new(ModelHandle::with_model(loaded), config.predictor, None)?;

    let sample = sampler.sample_sequence(sampler_config.lookback, args.sensor.as_deref())?;
    let sensor_id = format_sensor_id(sample.sensor_index);
    let prediction = predictor.predict(sample.window.view(), Some(&sensor_id), false, None)?;

    match format {
        OutputFormat::Json => print_json(&prediction)?,
        OutputFormat::Table => {
            let result = &prediction.result;
            print_heading("Prediction");
            print_field("Sensor", &sensor_id);
            print_field("Window start", sample.time_index);
            print_field("Model", format!("{} ({})", result.model_type, result.model_version));
            print_field("Flow", format_float(result.flow as f64));
            print_field("Density", format_float(result.density as f64));
            if let Some(speed) = result.speed {
                print_field("Speed", format_float(speed as f64));
            }
            print_field(
                "Congestion",
                color_congestion(result.congestion_status, &result.congestion_level),
            );
            print_field("Confidence", color_confidence(result.confidence));
            print_field("Target time", result.target_time.to_rfc3339());
            if sampler.scalers().is_none() {
                println!();
                print_warning("Input was not scaled; pass --scalers to match the training inputs");
            }
        }
    }
    Ok(())
}

/// Row for per-feature statistics
#[derive(Tabled)]
struct FeatureRow {
    #[tabled(rename = "Feature")]
    feature: String,
    #[tabled(rename = "Min")]
    min: String,
    #[tabled(rename = "Max")]
    max: String,
    #[tabled(rename = "Mean")]
    mean: String,
    #[tabled(rename = "Std")]
    std: String,
}

fn feature_rows(stats: &SensorStatistics) -> Vec<FeatureRow> {
    Feature::ALL
        .iter()
        .map(|&feature| {
            let s = stats.feature(feature);
            FeatureRow {
                feature: feature.name().to_string(),
                min: format_float(s.min as f64),
                max: format_float(s.max as f64),
                mean: format_float(s.mean as f64),
                std: format_float(s.std as f64),
            }
        })
        .collect()
}

/// Print one sensor's statistics
pub fn print_statistics(stats: &SensorStatistics, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(stats)?,
        OutputFormat::Table => {
            print_heading("Sensor Statistics");
            print_field("Sensor", format_sensor_id(stats.sensor_index));
            print_field("Timesteps", stats.num_timesteps);
            println!();
            print_table(&feature_rows(stats));
        }
    }
    Ok(())
}

/// Historical statistics for one sensor of a local dataset
pub async fn stats(data: PathBuf, sensor: usize, format: OutputFormat) -> Result<()> {
    let sampler = open_sampler(&SamplerConfig {
        data_path: data,
        ..Default::default()
    })?;
    let stats = sampler.get_sensor_statistics(sensor)?;
    print_statistics(&stats, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forecast_lib::FeatureStats;
    use ndarray::Array2;

    #[test]
    fn test_step_rows_follow_time_index() {
        let sample = SensorSample {
            sensor_index: 2,
            time_index: 40,
            window: Array2::from_shape_vec((2, 3), vec![1.0, 0.1, 60.0, 2.0, 0.2, 55.0]).unwrap(),
        };
        let rows = step_rows(&sample);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].step, 41);
        assert_eq!(rows[1].speed, "55.0000");
    }

    #[test]
    fn test_feature_rows_in_column_order() {
        let s = |v: f32| FeatureStats {
            min: v,
            max: v,
            mean: v,
            std: 0.0,
        };
        let stats = SensorStatistics {
            sensor_index: 0,
            num_timesteps: 10,
            flow: s(1.0),
            occupancy: s(2.0),
            speed: s(3.0),
        };
        let rows = feature_rows(&stats);
        let names: Vec<_> = rows.iter().map(|r| r.feature.as_str()).collect();
        assert_eq!(names, ["flow", "occupancy", "speed"]);
        assert_eq!(rows[2].mean, "3.0000");
    }

    #[test]
    fn test_sampler_config_from_flags() {
        let args = SampleArgs {
            data: PathBuf::from("data/raw/PEMS04"),
            scalers: None,
            sensor: None,
            lookback: None,
            seed: Some(9),
        };
        let config = args.sampler_config(&CliConfig::default());
        assert_eq!(config.lookback, 12);
        assert_eq!(config.sampling, SamplingMode::Seeded { seed: 9 });
    }
}
