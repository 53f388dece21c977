//! Server configuration
//!
//! Defaults, then an optional file named by `TRAFFIC_CONFIG`, then
//! `TRAFFIC_*` environment variables (`__` separates nested keys, e.g.
//! `TRAFFIC_SAMPLER__DATA_PATH`).

use anyhow::{Context, Result};
use forecast_lib::persistence::PersistenceConfig;
use forecast_lib::predictor::{PredictorConfig, SamplerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "TRAFFIC_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Checkpoint loaded at startup
    pub model_path: PathBuf,
    /// Persist predictions made by `/predict/demo` unless the request says otherwise
    pub persist_demo_predictions: bool,
    pub sampler: SamplerConfig,
    pub predictor: PredictorConfig,
    pub persistence: PersistenceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            model_path: PathBuf::from("models/best/lstm_best.safetensors"),
            persist_demo_predictions: true,
            sampler: SamplerConfig::default(),
            predictor: PredictorConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load using `TRAFFIC_CONFIG` and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("TRAFFIC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read server configuration")?;

        let server: ServerConfig = config
            .try_deserialize()
            .context("Invalid server configuration")?;
        server.validate()?;
        Ok(server)
    }

    pub fn validate(&self) -> Result<()> {
        self.predictor
            .validate()
            .context("Invalid predictor configuration")?;
        self.persistence
            .validate()
            .context("Invalid persistence configuration")?;
        if self.sampler.lookback == 0 {
            anyhow::bail!("sampler.lookback must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.sampler.lookback, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
port = 9100
model_path = "ckpt/gru_best.safetensors"

[predictor.calibration]
clear_below = 0.5

[persistence]
backend = "memory"
"#
        )
        .unwrap();

        let config = ServerConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.model_path, PathBuf::from("ckpt/gru_best.safetensors"));
        assert_eq!(config.predictor.calibration.clear_below, 0.5);
        assert_eq!(config.predictor.calibration.normal_below, 1.5);
        assert_eq!(config.persistence.open_store().name(), "memory");
    }

    #[test]
    fn test_invalid_calibration_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[predictor.calibration]
clear_below = 2.0
normal_below = 1.0
"#
        )
        .unwrap();
        assert!(ServerConfig::load_from(Some(file.path())).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(ServerConfig::load_from(Some(Path::new("/nonexistent/traffic.toml"))).is_err());
    }
}
