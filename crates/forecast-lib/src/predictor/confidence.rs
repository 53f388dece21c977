//! Confidence attached to each prediction

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::model::RecurrentRegressor;

pub const DEFAULT_CONFIDENCE: f32 = 0.85;

/// How the confidence field is produced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConfidenceMode {
    /// Fixed value, clamped to [0, 1]
    Constant { value: f32 },
    /// Repeat the forward pass with dropout active; confidence shrinks as the
    /// spread of the sampled outputs grows
    McDropout { samples: usize },
}

impl Default for ConfidenceMode {
    fn default() -> Self {
        ConfidenceMode::Constant {
            value: DEFAULT_CONFIDENCE,
        }
    }
}

impl ConfidenceMode {
    pub fn validate(&self) -> Result<()> {
        match *self {
            ConfidenceMode::Constant { value } if !(0.0..=1.0).contains(&value) => Err(
                ForecastError::config(format!("constant confidence {value} is outside [0, 1]")),
            ),
            ConfidenceMode::McDropout { samples } if samples < 2 => Err(ForecastError::config(
                "mc_dropout confidence needs at least 2 samples",
            )),
            _ => Ok(()),
        }
    }

    /// One confidence per row of `xs` (batch, time, features)
    pub fn estimate(&self, model: &RecurrentRegressor, xs: &Tensor) -> Result<Vec<f32>> {
        let batch = xs.dim(0)?;
        match *self {
            ConfidenceMode::Constant { value } => Ok(vec![value.clamp(0.0, 1.0); batch]),
            ConfidenceMode::McDropout { samples } => {
                let draws = (0..samples)
                    .map(|_| model.forward(xs, true))
                    .collect::<Result<Vec<_>>>()?;
                // (samples, batch, outputs)
                let stacked = Tensor::stack(&draws, 0)?;
                let spread = stacked.var_keepdim(0)?.sqrt()?.squeeze(0)?;
                let mean_std = spread.mean(D::Minus1)?.to_vec1::<f32>()?;
                Ok(mean_std.into_iter().map(spread_to_confidence).collect())
            }
        }
    }
}

/// 1 / (1 + spread), in [0, 1] for any non-negative spread
pub fn spread_to_confidence(mean_std: f32) -> f32 {
    if !mean_std.is_finite() || mean_std < 0.0 {
        return 0.0;
    }
    1.0 / (1.0 + mean_std)
}
