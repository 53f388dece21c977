//! Congestion classification on the predicted density channel
//!
//! The density channel is a model-output proxy, not a physical occupancy
//! fraction, so the band edges are a calibration table rather than constants.

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::models::CongestionLevel;

/// Upper (exclusive) band edges for the first three congestion levels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionCalibration {
    pub clear_below: f32,
    pub normal_below: f32,
    pub congested_below: f32,
}

impl Default for CongestionCalibration {
    fn default() -> Self {
        Self {
            clear_below: 0.8,
            normal_below: 1.5,
            congested_below: 2.2,
        }
    }
}

impl CongestionCalibration {
    pub fn new(clear_below: f32, normal_below: f32, congested_below: f32) -> Result<Self> {
        let calibration = Self {
            clear_below,
            normal_below,
            congested_below,
        };
        calibration.validate()?;
        Ok(calibration)
    }

    /// Edges must be finite and strictly increasing
    pub fn validate(&self) -> Result<()> {
        let edges = [self.clear_below, self.normal_below, self.congested_below];
        if edges.iter().any(|e| !e.is_finite()) {
            return Err(ForecastError::config(format!(
                "congestion thresholds must be finite, got {edges:?}"
            )));
        }
        if !(self.clear_below < self.normal_below && self.normal_below < self.congested_below) {
            return Err(ForecastError::config(format!(
                "congestion thresholds must be strictly increasing, got {edges:?}"
            )));
        }
        Ok(())
    }

    /// Map a predicted density to its band. NaN falls through to the top band.
    pub fn classify(&self, density: f32) -> CongestionLevel {
        if density < self.clear_below {
            CongestionLevel::Clear
        } else if density < self.normal_below {
            CongestionLevel::Normal
        } else if density < self.congested_below {
            CongestionLevel::Congested
        } else {
            CongestionLevel::SeverelyCongested
        }
    }
}
