//! Checkpoint files
//!
//! A checkpoint is one safetensors file. The tensors are the model
//! parameters under their variable names; the header metadata carries the
//! JSON model config (`config`) and optional JSON training metadata
//! (`training`). Files are written to a temporary path, synced, then renamed
//! so a crash mid-write never leaves a truncated `best` checkpoint behind.

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{ModelConfig, ModelKind, RecurrentRegressor};
use crate::error::{ForecastError, Result};

const CONFIG_KEY: &str = "config";
const TRAINING_KEY: &str = "training";

/// Where training stood when a checkpoint was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub saved_at: DateTime<Utc>,
    /// `best` or `periodic`
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCheckpoint {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub model: RecurrentRegressor,
    pub metadata: Option<TrainingMetadata>,
    pub sha256: String,
}

impl LoadedCheckpoint {
    /// Short version string identifying these weights
    pub fn version(&self) -> String {
        let digest = &self.sha256[..self.sha256.len().min(8)];
        match &self.metadata {
            Some(meta) => format!("{}-e{}-{}", self.model.kind(), meta.epoch, digest),
            None => format!("{}-{}", self.model.kind(), digest),
        }
    }
}

/// `<dir>/best/<type>_best.safetensors`
pub fn best_checkpoint_path(dir: impl AsRef<Path>, kind: ModelKind) -> PathBuf {
    dir.as_ref()
        .join("best")
        .join(format!("{kind}_best.safetensors"))
}

/// `<dir>/checkpoints/<type>_epoch_<n>.safetensors`
pub fn epoch_checkpoint_path(dir: impl AsRef<Path>, kind: ModelKind, epoch: usize) -> PathBuf {
    dir.as_ref()
        .join("checkpoints")
        .join(format!("{kind}_epoch_{epoch}.safetensors"))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("safetensors.tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Serialize parameters, config and metadata to `path`
pub fn save_checkpoint(
    model: &RecurrentRegressor,
    metadata: Option<&TrainingMetadata>,
    path: impl AsRef<Path>,
) -> Result<SavedCheckpoint> {
    let path = path.as_ref();
    let tensors = model.named_tensors()?;

    let mut header = HashMap::new();
    header.insert(CONFIG_KEY.to_string(), serde_json::to_string(model.config())?);
    if let Some(meta) = metadata {
        header.insert(TRAINING_KEY.to_string(), serde_json::to_string(meta)?);
    }

    let bytes = safetensors::serialize(
        tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
        &Some(header),
    )?;
    write_atomic(path, &bytes)?;

    let saved = SavedCheckpoint {
        path: path.to_path_buf(),
        sha256: sha256_hex(&bytes),
        size_bytes: bytes.len() as u64,
    };
    debug!(
        path = %path.display(),
        sha256 = %saved.sha256,
        size_bytes = saved.size_bytes,
        "Wrote checkpoint"
    );
    Ok(saved)
}

/// Rebuild a model from a checkpoint written by [`save_checkpoint`]
pub fn load_checkpoint(path: impl AsRef<Path>, device: &Device) -> Result<LoadedCheckpoint> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ForecastError::not_found("checkpoint", path));
    }
    let bytes = fs::read(path)?;

    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let fields = header.metadata().clone().unwrap_or_default();
    let config: ModelConfig = match fields.get(CONFIG_KEY) {
        Some(json) => serde_json::from_str(json)?,
        None => {
            return Err(ForecastError::config(format!(
                "checkpoint {} carries no model config",
                path.display()
            )))
        }
    };
    let metadata = match fields.get(TRAINING_KEY) {
        Some(json) => Some(serde_json::from_str::<TrainingMetadata>(json)?),
        None => None,
    };

    let tensors: HashMap<String, Tensor> = candle_core::safetensors::load_buffer(&bytes, device)?;
    let model = RecurrentRegressor::new(config, device)?;
    model.load_tensors(&tensors)?;

    let loaded = LoadedCheckpoint {
        model,
        metadata,
        sha256: sha256_hex(&bytes),
    };
    info!(
        path = %path.display(),
        model_type = %loaded.model.kind(),
        version = %loaded.version(),
        "Loaded checkpoint"
    );
    Ok(loaded)
}
