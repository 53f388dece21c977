//! Configuration for local commands
//!
//! Defaults, then the optional `--config` file, then `TFP_*` environment
//! variables (`__` separates nested keys, e.g. `TFP_TRAINING__EPOCHS`).
//! Command-line flags are applied last by each command.

use anyhow::{Context, Result};
use forecast_lib::data::{DatasetConfig, PreprocessConfig, SplitRatios};
use forecast_lib::model::ModelConfig;
use forecast_lib::predictor::PredictorConfig;
use forecast_lib::training::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub preprocess: PreprocessConfig,
    pub dataset: DatasetConfig,
    pub split: SplitRatios,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub predictor: PredictorConfig,
}

impl CliConfig {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("TFP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read CLI configuration")?;

        let cli: CliConfig = config
            .try_deserialize()
            .context("Invalid CLI configuration")?;
        cli.validate()?;
        Ok(cli)
    }

    pub fn validate(&self) -> Result<()> {
        self.preprocess
            .validate()
            .context("Invalid preprocess configuration")?;
        self.split.validate().context("Invalid split ratios")?;
        self.predictor
            .validate()
            .context("Invalid predictor configuration")?;
        Ok(())
    }
}
