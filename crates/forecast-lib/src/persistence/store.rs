//! Prediction stores
//!
//! A store reports success or failure as a value; it never panics and never
//! returns an error that could propagate into the prediction path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{ForecastError, Result};
use crate::models::PredictionRecord;

/// Result of one write to a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Saved,
    Failed(String),
}

impl PersistOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, PersistOutcome::Saved)
    }
}

/// External collaborator that keeps prediction records
#[async_trait]
pub trait PredictionStore: Send + Sync {
    async fn save(&self, record: &PredictionRecord) -> PersistOutcome;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Append-only JSON lines file, one record per line
pub struct JsonLinesStore {
    path: PathBuf,
    // Serializes appends so concurrent lines never interleave
    write_lock: Mutex<()>,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &PredictionRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every record back; a missing file yields `NotFound`
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<PredictionRecord>> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await? {
            return Err(ForecastError::not_found("prediction store", path));
        }
        let content = tokio::fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(ForecastError::from))
            .collect()
    }
}

#[async_trait]
impl PredictionStore for JsonLinesStore {
    async fn save(&self, record: &PredictionRecord) -> PersistOutcome {
        match self.append(record).await {
            Ok(()) => PersistOutcome::Saved,
            Err(e) => PersistOutcome::Failed(e.to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

/// In-process store, used by tests and when persistence targets memory
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<PredictionRecord>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<PredictionRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn save(&self, record: &PredictionRecord) -> PersistOutcome {
        if self.failing.load(Ordering::SeqCst) {
            return PersistOutcome::Failed("memory store is set to fail".to_string());
        }
        self.records.lock().await.push(record.clone());
        PersistOutcome::Saved
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
