//! Validation-loss trackers: early stopping and learning-rate decay on plateau

use serde::{Deserialize, Serialize};

/// Outcome of feeding one validation loss to [`EarlyStopping`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// New best loss
    Improved,
    /// No improvement, `epochs_without_improvement` so far
    Wait { epochs_without_improvement: usize },
    /// Patience exhausted
    Stop,
}

/// Stops a run after `patience` consecutive epochs without a new best loss
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    best_epoch: usize,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: None,
            best_epoch: 0,
            counter: 0,
        }
    }

    /// Record the loss of `epoch` (1-based)
    pub fn step(&mut self, epoch: usize, val_loss: f64) -> StopDecision {
        let improved = match self.best {
            None => true,
            Some(best) => val_loss < best - self.min_delta,
        };
        if improved {
            self.best = Some(val_loss);
            self.best_epoch = epoch;
            self.counter = 0;
            return StopDecision::Improved;
        }
        self.counter += 1;
        if self.counter >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Wait {
                epochs_without_improvement: self.counter,
            }
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    /// Relative improvement needed to reset the plateau counter
    pub threshold: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 5,
            min_lr: 1e-6,
            threshold: 1e-4,
        }
    }
}

/// Multiplies the learning rate by `factor` once the loss has failed to
/// improve for more than `patience` epochs
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, config: PlateauConfig) -> Self {
        Self {
            config,
            lr: initial_lr,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Feed one validation loss; returns the new rate when it was reduced
    pub fn step(&mut self, val_loss: f64) -> Option<f64> {
        if val_loss < self.best * (1.0 - self.config.threshold) {
            self.best = val_loss;
            self.bad_epochs = 0;
            return None;
        }
        self.bad_epochs += 1;
        if self.bad_epochs > self.config.patience {
            self.bad_epochs = 0;
            let reduced = (self.lr * self.config.factor).max(self.config.min_lr);
            if reduced < self.lr {
                self.lr = reduced;
                return Some(reduced);
            }
        }
        None
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_patience_non_improving_epochs() {
        let mut stopper = EarlyStopping::new(3, 0.0);
        let losses = [1.0, 0.9, 0.95, 0.96, 0.97];
        let mut stopped_at = None;
        for (i, loss) in losses.iter().enumerate() {
            if stopper.step(i + 1, *loss) == StopDecision::Stop {
                stopped_at = Some(i + 1);
                break;
            }
        }
        assert_eq!(stopped_at, Some(5));
        assert_eq!(stopper.best(), Some(0.9));
        assert_eq!(stopper.best_epoch(), 2);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut stopper = EarlyStopping::new(2, 0.0);
        assert_eq!(stopper.step(1, 1.0), StopDecision::Improved);
        assert_eq!(
            stopper.step(2, 1.0),
            StopDecision::Wait {
                epochs_without_improvement: 1
            }
        );
        assert_eq!(stopper.step(3, 0.5), StopDecision::Improved);
        assert_eq!(
            stopper.step(4, 0.6),
            StopDecision::Wait {
                epochs_without_improvement: 1
            }
        );
        assert_eq!(stopper.step(5, 0.7), StopDecision::Stop);
    }

    #[test]
    fn test_min_delta_requires_real_improvement() {
        let mut stopper = EarlyStopping::new(5, 0.1);
        stopper.step(1, 1.0);
        assert_ne!(stopper.step(2, 0.95), StopDecision::Improved);
        assert_eq!(stopper.step(3, 0.85), StopDecision::Improved);
    }

    #[test]
    fn test_plateau_halves_rate_after_patience() {
        let mut scheduler = PlateauScheduler::new(1e-3, PlateauConfig::default());
        assert_eq!(scheduler.step(1.0), None);
        for _ in 0..5 {
            assert_eq!(scheduler.step(1.0), None);
        }
        assert_eq!(scheduler.step(1.0), Some(5e-4));
        assert_eq!(scheduler.learning_rate(), 5e-4);
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let config = PlateauConfig {
            patience: 0,
            min_lr: 4e-4,
            ..Default::default()
        };
        let mut scheduler = PlateauScheduler::new(1e-3, config);
        scheduler.step(1.0);
        assert_eq!(scheduler.step(1.0), Some(5e-4));
        assert_eq!(scheduler.step(1.0), Some(4e-4));
        assert_eq!(scheduler.step(1.0), None);
        assert_eq!(scheduler.learning_rate(), 4e-4);
    }
}
