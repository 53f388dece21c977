//! Traffic-sensor forecasting core
//!
//! This crate provides:
//! - Raw series loading, preprocessing and windowed datasets
//! - LSTM/GRU recurrent regressors with safetensors checkpoints
//! - Training with early stopping, LR decay and held-out evaluation
//! - Inference with congestion classification and on-demand sensor sampling
//! - Best-effort persistence of predictions
//! - Health checks and observability

pub mod data;
pub mod error;
pub mod health;
pub mod model;
pub mod models;
pub mod observability;
pub mod persistence;
pub mod predictor;
pub mod training;

pub use error::{ForecastError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ForecastMetrics, StructuredLogger};
