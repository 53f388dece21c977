//! Serving shell for the traffic forecasting core
//!
//! Owns the model handle, sampler and persistence worker, and exposes
//! health, metrics and prediction routes over HTTP.

pub mod api;
pub mod config;

pub use api::{create_router, serve, AppState};
pub use config::ServerConfig;
