//! Builds on-demand inference inputs from the raw dataset
//!
//! A sample is one sensor's `lookback` consecutive timesteps, starting at a
//! random time index. With a fixed seed the sequence of samples is
//! reproducible; otherwise every call draws fresh randomness.

use ndarray::{s, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::data::{FittedScalers, RawSeries};
use crate::error::{ForecastError, Result};
use crate::models::{parse_sensor_id, Feature, FeatureStats, SensorStatistics, NUM_FEATURES};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SamplingMode {
    #[default]
    Random,
    Seeded { seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// `.npz`, `.npy` or a dataset directory
    pub data_path: PathBuf,
    /// Scalers applied to sampled windows so they match the training inputs
    pub scaler_path: Option<PathBuf>,
    pub lookback: usize,
    pub sampling: SamplingMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/raw/PEMS04"),
            scaler_path: None,
            lookback: 12,
            sampling: SamplingMode::Random,
        }
    }
}

/// One sensor window ready for the model
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub sensor_index: usize,
    /// First timestep of the window
    pub time_index: usize,
    /// (lookback, features); scaled when the sampler has scalers
    pub window: Array2<f32>,
}

pub struct SensorSampler {
    series: Arc<RawSeries>,
    scalers: Option<FittedScalers>,
    rng: Mutex<StdRng>,
}

impl SensorSampler {
    pub fn new(series: Arc<RawSeries>, mode: SamplingMode) -> Self {
        let rng = match mode {
            SamplingMode::Random => StdRng::from_entropy(),
            SamplingMode::Seeded { seed } => StdRng::seed_from_u64(seed),
        };
        Self {
            series,
            scalers: None,
            rng: Mutex::new(rng),
        }
    }

    /// Load the dataset (and scalers, if configured) named by `config`.
    /// A missing dataset is `NotFound`.
    pub fn open(config: &SamplerConfig) -> Result<Self> {
        let series = RawSeries::load(&config.data_path)?;
        let mut sampler = Self::new(Arc::new(series), config.sampling);
        if let Some(path) = &config.scaler_path {
            sampler = sampler.with_scalers(FittedScalers::load(path)?)?;
        }
        Ok(sampler)
    }

    pub fn with_scalers(mut self, scalers: FittedScalers) -> Result<Self> {
        if scalers.num_sensors != self.series.num_sensors() {
            return Err(ForecastError::config(format!(
                "scalers cover {} sensors but the dataset has {}",
                scalers.num_sensors,
                self.series.num_sensors()
            )));
        }
        self.scalers = Some(scalers);
        Ok(self)
    }

    pub fn series(&self) -> &RawSeries {
        &self.series
    }

    pub fn num_sensors(&self) -> usize {
        self.series.num_sensors()
    }

    pub fn scalers(&self) -> Option<&FittedScalers> {
        self.scalers.as_ref()
    }

    /// Resolve `sensor_id` (or a random sensor when `None`) and draw a
    /// window of `lookback` steps
    pub fn sample_sequence(&self, lookback: usize, sensor_id: Option<&str>) -> Result<SensorSample> {
        let max_start = self.max_start(lookback)?;
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());

        let sensor_index = match sensor_id {
            Some(id) => {
                let index = parse_sensor_id(id)?;
                self.check_sensor(index)?;
                index
            }
            None => rng.gen_range(0..self.num_sensors()),
        };
        let time_index = rng.gen_range(0..=max_start);
        drop(rng);

        debug!(sensor_index, time_index, lookback, "Sampled sensor window");
        self.sample_at(sensor_index, time_index, lookback)
    }

    /// Window for an explicit sensor and start time
    pub fn sample_at(&self, sensor_index: usize, time_index: usize, lookback: usize) -> Result<SensorSample> {
        let max_start = self.max_start(lookback)?;
        self.check_sensor(sensor_index)?;
        if time_index > max_start {
            return Err(ForecastError::InvalidInput(format!(
                "time index {time_index} leaves fewer than {lookback} steps (last valid start {max_start})"
            )));
        }

        let mut window = self
            .series
            .data()
            .slice(s![time_index..time_index + lookback, sensor_index, ..])
            .to_owned();
        if let Some(scalers) = &self.scalers {
            scalers.transform_window(sensor_index, window.view_mut())?;
        }

        Ok(SensorSample {
            sensor_index,
            time_index,
            window,
        })
    }

    /// Summary of one sensor's raw history; NaN readings are ignored
    pub fn get_sensor_statistics(&self, sensor_index: usize) -> Result<SensorStatistics> {
        let history = self.series.sensor(sensor_index)?;
        let mut per_feature = [FeatureStats {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std: 0.0,
        }; NUM_FEATURES];
        for feature in Feature::ALL {
            per_feature[feature.index()] = feature_stats(history.column(feature.index()).iter().copied());
        }

        Ok(SensorStatistics {
            sensor_index,
            num_timesteps: history.nrows(),
            flow: per_feature[Feature::Flow.index()],
            occupancy: per_feature[Feature::Occupancy.index()],
            speed: per_feature[Feature::Speed.index()],
        })
    }

    fn check_sensor(&self, index: usize) -> Result<()> {
        if index >= self.num_sensors() {
            return Err(ForecastError::SensorOutOfRange {
                index,
                num_sensors: self.num_sensors(),
            });
        }
        Ok(())
    }

    fn max_start(&self, lookback: usize) -> Result<usize> {
        let steps = self.series.num_timesteps();
        if lookback == 0 || lookback > steps {
            return Err(ForecastError::config(format!(
                "lookback {lookback} must be in 1..={steps} for this dataset"
            )));
        }
        Ok(steps - lookback)
    }
}

/// Population statistics over the finite values of one column
fn feature_stats(values: impl Iterator<Item = f32>) -> FeatureStats {
    let mut count = 0usize;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for v in values.filter(|v| v.is_finite()).map(f64::from) {
        count += 1;
        min = min.min(v);
        max = max.max(v);
        sum += v;
        sum_sq += v * v;
    }
    if count == 0 {
        return FeatureStats {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std: 0.0,
        };
    }
    let mean = sum / count as f64;
    let var = (sum_sq / count as f64 - mean * mean).max(0.0);
    FeatureStats {
        min: min as f32,
        max: max as f32,
        mean: mean as f32,
        std: var.sqrt() as f32,
    }
}
