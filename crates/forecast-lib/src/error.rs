//! Error taxonomy for the forecasting core
//!
//! Construction errors propagate immediately; inference errors keep
//! "model not loaded" apart from "malformed input"; persistence errors never
//! cross the `predict()` boundary (see [`crate::persistence`]).

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, ForecastError>;

#[derive(Debug, Error)]
pub enum ForecastError {
    /// Window sizes exceed the series, unknown method names, invalid model type
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A raw data file or checkpoint is absent
    #[error("{what} not found at {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    /// NaN/Inf during training
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Write to the external prediction store failed
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("no model is loaded")]
    ModelNotLoaded,

    /// Input array shape does not match what the model expects
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("sensor index {index} out of range (dataset has {num_sensors} sensors)")]
    SensorOutOfRange { index: usize, num_sensors: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to read array file: {0}")]
    ArrayRead(String),
}

impl ForecastError {
    pub fn config(msg: impl Into<String>) -> Self {
        ForecastError::Configuration(msg.into())
    }

    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        ForecastError::NotFound {
            what,
            path: path.into(),
        }
    }

    /// True for conditions an operator fixes by completing setup (download
    /// the dataset, train a model) rather than by changing the request.
    pub fn is_retryable_after_setup(&self) -> bool {
        matches!(
            self,
            ForecastError::NotFound { .. } | ForecastError::ModelNotLoaded
        )
    }
}

impl From<ndarray_npy::ReadNpyError> for ForecastError {
    fn from(e: ndarray_npy::ReadNpyError) -> Self {
        ForecastError::ArrayRead(e.to_string())
    }
}

impl From<ndarray_npy::ReadNpzError> for ForecastError {
    fn from(e: ndarray_npy::ReadNpzError) -> Self {
        ForecastError::ArrayRead(e.to_string())
    }
}

impl From<safetensors::SafeTensorError> for ForecastError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ForecastError::ArrayRead(format!("safetensors: {e}"))
    }
}
