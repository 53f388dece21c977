//! Core data models shared by the pipeline and the serving layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ForecastError;

/// Number of per-sensor features in the raw series
pub const NUM_FEATURES: usize = 3;

/// Raw feature channels, in the column order the source files use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Flow,
    Occupancy,
    Speed,
}

impl Feature {
    pub const ALL: [Feature; NUM_FEATURES] = [Feature::Flow, Feature::Occupancy, Feature::Speed];

    /// Column index in a (timestep, sensor, feature) array
    pub fn index(self) -> usize {
        match self {
            Feature::Flow => 0,
            Feature::Occupancy => 1,
            Feature::Speed => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Feature::Flow => "flow",
            Feature::Occupancy => "occupancy",
            Feature::Speed => "speed",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flow" => Ok(Feature::Flow),
            "occupancy" => Ok(Feature::Occupancy),
            "speed" => Ok(Feature::Speed),
            other => Err(ForecastError::config(format!("unknown feature '{other}'"))),
        }
    }
}

/// Discrete congestion class derived from the predicted density channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    Clear,
    Normal,
    Congested,
    SeverelyCongested,
}

impl CongestionLevel {
    /// Integer status code 0-3
    pub fn code(self) -> u8 {
        match self {
            CongestionLevel::Clear => 0,
            CongestionLevel::Normal => 1,
            CongestionLevel::Congested => 2,
            CongestionLevel::SeverelyCongested => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CongestionLevel::Clear),
            1 => Some(CongestionLevel::Normal),
            2 => Some(CongestionLevel::Congested),
            3 => Some(CongestionLevel::SeverelyCongested),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CongestionLevel::Clear => "clear",
            CongestionLevel::Normal => "normal",
            CongestionLevel::Congested => "congested",
            CongestionLevel::SeverelyCongested => "severely congested",
        }
    }
}

impl fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Output of one inference call, handed to the serving layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    pub flow: f32,
    /// Density proxy (second output channel), 0.0 when the model has one output
    pub density: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    pub congestion_status: u8,
    pub congestion_level: String,
    pub confidence: f32,
    pub prediction_time: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub model_type: String,
    pub model_version: String,
}

impl PredictionResult {
    pub fn congestion(&self) -> Option<CongestionLevel> {
        CongestionLevel::from_code(self.congestion_status)
    }
}

/// Flat record accepted by the external prediction store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub sensor_id: String,
    pub prediction_time: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub flow_prediction: f32,
    pub density_prediction: f32,
    /// Label string, not the status code
    pub congestion_prediction: String,
    pub confidence: f32,
    pub model_version: String,
}

impl PredictionRecord {
    /// Build a record from a result; `None` when the result carries no sensor id
    pub fn from_result(result: &PredictionResult) -> Option<Self> {
        let sensor_id = result.sensor_id.clone()?;
        Some(Self {
            sensor_id,
            prediction_time: result.prediction_time,
            target_time: result.target_time,
            flow_prediction: result.flow,
            density_prediction: result.density,
            congestion_prediction: result.congestion_level.clone(),
            confidence: result.confidence,
            model_version: result.model_version.clone(),
        })
    }
}

/// Summary statistics for one feature of one sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

/// Historical statistics for one sensor, per feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStatistics {
    pub sensor_index: usize,
    pub num_timesteps: usize,
    pub flow: FeatureStats,
    pub occupancy: FeatureStats,
    pub speed: FeatureStats,
}

impl SensorStatistics {
    pub fn feature(&self, feature: Feature) -> &FeatureStats {
        match feature {
            Feature::Flow => &self.flow,
            Feature::Occupancy => &self.occupancy,
            Feature::Speed => &self.speed,
        }
    }
}

/// Canonical string form of a sensor index (`sensor_003`)
pub fn format_sensor_id(index: usize) -> String {
    format!("sensor_{index:03}")
}

/// Parse `sensor_003` or a bare `3` into a sensor index
pub fn parse_sensor_id(id: &str) -> Result<usize, ForecastError> {
    let trimmed = id.trim();
    let digits = trimmed.strip_prefix("sensor_").unwrap_or(trimmed);
    digits
        .parse::<usize>()
        .map_err(|_| ForecastError::InvalidInput(format!("malformed sensor id '{id}'")))
}
