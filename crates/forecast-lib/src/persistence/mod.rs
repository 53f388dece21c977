//! Best-effort persistence of prediction records
//!
//! Failures here are logged and counted; they never fail a prediction.

mod store;
mod worker;

pub use store::{JsonLinesStore, MemoryStore, PersistOutcome, PredictionStore};
pub use worker::{PersistStatus, PersistenceQueue, PersistenceStats, PersistenceWorker};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ForecastError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Jsonl,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub backend: StoreBackend,
    /// Target file for the `jsonl` backend
    pub path: PathBuf,
    pub queue_capacity: usize,
    pub write_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: StoreBackend::Jsonl,
            path: PathBuf::from("data/predictions.jsonl"),
            queue_capacity: 256,
            write_timeout_ms: 2000,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ForecastError::config("persistence queue_capacity must be > 0"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ForecastError::config("persistence write_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Build the configured store
    pub fn open_store(&self) -> Arc<dyn PredictionStore> {
        match self.backend {
            StoreBackend::Jsonl => Arc::new(JsonLinesStore::new(self.path.clone())),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        }
    }
}
