//! Recurrent regressor
//!
//! Two interchangeable variants share one topology:
//! ```text
//! (batch, time, input_size)
//!   -> recurrent stack (num_layers x hidden_size, optionally bidirectional)
//!   -> dropout
//!   -> recurrent layer (hidden_size / 2), last timestep only
//!   -> dropout -> Linear(hidden_size / 2 -> 32) -> ReLU -> dropout
//!   -> Linear(32 -> output_size)
//! ```

pub mod cell;
pub mod checkpoint;
pub mod init;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{ForecastError, Result};
use cell::{GruCell, LstmCell, StackedRegressor};

pub use checkpoint::{
    best_checkpoint_path, epoch_checkpoint_path, load_checkpoint, save_checkpoint, LoadedCheckpoint,
    SavedCheckpoint, TrainingMetadata,
};

/// Recurrent cell variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Lstm,
    Gru,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Lstm => "lstm",
            ModelKind::Gru => "gru",
        }
    }

    /// Display name used in prediction results
    pub fn display_name(self) -> &'static str {
        match self {
            ModelKind::Lstm => "LSTM",
            ModelKind::Gru => "GRU",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lstm" => Ok(ModelKind::Lstm),
            "gru" => Ok(ModelKind::Gru),
            other => Err(ForecastError::config(format!(
                "unknown model type '{other}', expected 'lstm' or 'gru'"
            ))),
        }
    }
}

/// Hyperparameters; enough to rebuild an identical (untrained) network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelKind,
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub output_size: usize,
    pub dropout: f32,
    pub bidirectional: bool,
    /// Seed for parameter initialization
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelKind::Lstm,
            input_size: 3,
            hidden_size: 128,
            num_layers: 2,
            output_size: 3,
            dropout: 0.2,
            bidirectional: false,
            seed: 42,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.output_size == 0 || self.num_layers == 0 {
            return Err(ForecastError::config(
                "input_size, output_size and num_layers must be positive",
            ));
        }
        if self.hidden_size < 2 || self.hidden_size % 2 != 0 {
            return Err(ForecastError::config(format!(
                "hidden_size must be even and at least 2, got {}",
                self.hidden_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ForecastError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

enum Network {
    Lstm(StackedRegressor<LstmCell>),
    Gru(StackedRegressor<GruCell>),
}

/// A recurrent regressor together with the variables it owns
///
/// Parameters are only mutated by the optimizer during training; inference
/// through `&self` is safe from many threads at once.
pub struct RecurrentRegressor {
    config: ModelConfig,
    varmap: VarMap,
    device: Device,
    network: Network,
}

impl fmt::Debug for RecurrentRegressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurrentRegressor")
            .field("config", &self.config)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl RecurrentRegressor {
    /// Build a freshly initialized network of the configured variant
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let network = match config.model_type {
            ModelKind::Lstm => Network::Lstm(StackedRegressor::new(&config, vb)?),
            ModelKind::Gru => Network::Gru(StackedRegressor::new(&config, vb)?),
        };
        init::initialize(&varmap, config.seed)?;

        let model = Self {
            config,
            varmap,
            device: device.clone(),
            network,
        };
        debug!(
            model_type = %model.config.model_type,
            parameters = model.num_parameters(),
            "Built recurrent regressor"
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn kind(&self) -> ModelKind {
        self.config.model_type
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable variables, for the optimizer
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Run the network; `train` enables dropout
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.check_input(xs)?;
        let out = match &self.network {
            Network::Lstm(net) => net.forward(xs, train)?,
            Network::Gru(net) => net.forward(xs, train)?,
        };
        Ok(out)
    }

    /// Inference-mode forward pass
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward(xs, false)
    }

    fn check_input(&self, xs: &Tensor) -> Result<()> {
        match xs.dims() {
            [batch, steps, features] if *batch > 0 && *steps > 0 && *features == self.config.input_size => {
                Ok(())
            }
            dims => Err(ForecastError::InvalidInput(format!(
                "expected input of shape (batch, time, {}), got {:?}",
                self.config.input_size, dims
            ))),
        }
    }

    /// Snapshot of all parameters keyed by name, sorted
    pub fn named_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|e| ForecastError::config(format!("parameter map lock poisoned: {e}")))?;
        let mut named: Vec<(String, Tensor)> = vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<candle_core::Result<_>>()?;
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Overwrite parameters from a name -> tensor map; every parameter must be present
    pub fn load_tensors(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|e| ForecastError::config(format!("parameter map lock poisoned: {e}")))?;
        for (name, var) in vars.iter() {
            let tensor = tensors.get(name).ok_or_else(|| {
                ForecastError::config(format!("checkpoint is missing parameter {name}"))
            })?;
            if tensor.dims() != var.dims() {
                return Err(ForecastError::config(format!(
                    "parameter {name} has shape {:?} in checkpoint, model expects {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(DType::F32)?.to_device(&self.device)?)?;
        }
        Ok(())
    }
}
