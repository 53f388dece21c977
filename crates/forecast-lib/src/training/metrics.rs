//! Regression metrics and held-out evaluation

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::WindowedDataset;
use crate::error::{ForecastError, Result};
use crate::model::RecurrentRegressor;

/// Added to the MAPE denominator so zero targets stay finite
pub const MAPE_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mae: f64,
    pub rmse: f64,
    /// Percent
    pub mape: f64,
}

impl RegressionMetrics {
    /// Metrics over paired slices; `None` when empty or of unequal length
    pub fn compute(targets: &[f32], predictions: &[f32]) -> Option<Self> {
        if targets.is_empty() || targets.len() != predictions.len() {
            return None;
        }
        let n = targets.len() as f64;
        let mut abs = 0.0;
        let mut sq = 0.0;
        let mut pct = 0.0;
        for (&t, &p) in targets.iter().zip(predictions) {
            let (t, p) = (t as f64, p as f64);
            let err = t - p;
            abs += err.abs();
            sq += err * err;
            pct += (err / (t + MAPE_EPSILON)).abs();
        }
        Some(Self {
            mae: abs / n,
            rmse: (sq / n).sqrt(),
            mape: pct / n * 100.0,
        })
    }
}

/// Metrics overall and per output channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub overall: RegressionMetrics,
    pub per_output: Vec<RegressionMetrics>,
    pub num_samples: usize,
}

/// Runs a model over a dataset in index order, without dropout
pub struct Evaluator<'a> {
    model: &'a RecurrentRegressor,
    batch_size: usize,
    device: Device,
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a RecurrentRegressor, batch_size: usize) -> Self {
        Self {
            model,
            batch_size,
            device: model.device().clone(),
        }
    }

    pub fn evaluate(&self, dataset: &WindowedDataset) -> Result<EvaluationReport> {
        let outputs = self.model.config().output_size;
        let mut targets = Vec::with_capacity(dataset.len() * outputs);
        let mut predictions = Vec::with_capacity(dataset.len() * outputs);

        for batch in dataset.batches(self.batch_size, None, &self.device) {
            let (x, y) = batch?;
            let pred = self.model.predict(&x)?;
            if pred.dims() != y.dims() {
                return Err(ForecastError::InvalidInput(format!(
                    "model emits {:?} but targets are {:?}",
                    pred.dims(),
                    y.dims()
                )));
            }
            targets.extend(y.flatten_all()?.to_vec1::<f32>()?);
            predictions.extend(pred.flatten_all()?.to_vec1::<f32>()?);
        }

        let overall = RegressionMetrics::compute(&targets, &predictions)
            .ok_or_else(|| ForecastError::InvalidInput("evaluation dataset is empty".into()))?;
        let per_output = (0..outputs)
            .filter_map(|channel| {
                let pick = |v: &[f32]| -> Vec<f32> {
                    v.iter().skip(channel).step_by(outputs).copied().collect()
                };
                RegressionMetrics::compute(&pick(&targets), &pick(&predictions))
            })
            .collect();

        let report = EvaluationReport {
            overall,
            per_output,
            num_samples: dataset.len(),
        };
        info!(
            samples = report.num_samples,
            mae = report.overall.mae,
            rmse = report.overall.rmse,
            mape = report.overall.mape,
            "Evaluation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TargetMode;
    use crate::model::ModelConfig;
    use ndarray::Array2;

    #[test]
    fn test_metric_values() {
        let m = RegressionMetrics::compute(&[1.0, 2.0, 4.0], &[2.0, 2.0, 2.0]).unwrap();
        assert!((m.mae - 1.0).abs() < 1e-9);
        assert!((m.rmse - (5.0f64 / 3.0).sqrt()).abs() < 1e-9);
        // (1 + 0 + 0.5) / 3 * 100
        assert!((m.mape - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_mape_zero_target_is_finite() {
        let m = RegressionMetrics::compute(&[0.0], &[0.0]).unwrap();
        assert_eq!(m.mape, 0.0);
        let m = RegressionMetrics::compute(&[0.0], &[1e-9]).unwrap();
        assert!(m.mape.is_finite());
    }

    #[test]
    fn test_compute_rejects_mismatch() {
        assert!(RegressionMetrics::compute(&[], &[]).is_none());
        assert!(RegressionMetrics::compute(&[1.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_evaluator_covers_every_sample() {
        let config = ModelConfig {
            hidden_size: 4,
            num_layers: 1,
            ..Default::default()
        };
        let model = RecurrentRegressor::new(config, &Device::Cpu).unwrap();
        let data = Array2::from_shape_fn((30, 3), |(t, f)| ((t + f) % 7) as f32 / 7.0);
        let dataset = WindowedDataset::new(data, 6, TargetMode::NextStep, 1).unwrap();

        let report = Evaluator::new(&model, 5).evaluate(&dataset).unwrap();
        assert_eq!(report.num_samples, 24);
        assert_eq!(report.per_output.len(), 3);
        assert!(report.overall.rmse >= report.overall.mae);
    }
}
