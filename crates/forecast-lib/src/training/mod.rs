//! Training loop, early stopping, learning-rate schedule and evaluation

pub mod early_stopping;
pub mod metrics;
pub mod trainer;

pub use early_stopping::{EarlyStopping, PlateauConfig, PlateauScheduler, StopDecision};
pub use metrics::{EvaluationReport, Evaluator, RegressionMetrics, MAPE_EPSILON};
pub use trainer::{
    append_training_record, read_training_records, EpochStats, FitSummary, RunStatus, Trainer,
    TrainingConfig, TrainingRecord, TRAINING_RECORDS_FILE,
};
