//! Background writer that drains a bounded queue into a store
//!
//! Producers enqueue with `try_send` and never wait; each write is bounded by
//! a timeout so a stalled store cannot pile up work.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::store::{PersistOutcome, PredictionStore};
use super::PersistenceConfig;
use crate::health::{components, HealthRegistry};
use crate::models::PredictionRecord;
use crate::observability::{ForecastMetrics, StructuredLogger};

/// What happened to the persistence side effect of one prediction
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PersistStatus {
    NotRequested,
    Queued,
    Rejected(String),
}

#[derive(Debug, Default, Clone)]
pub struct PersistenceStats {
    pub queued: u64,
    pub rejected: u64,
    pub saved: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

/// Producer side; cheap to clone
#[derive(Clone)]
pub struct PersistenceQueue {
    sender: mpsc::Sender<PredictionRecord>,
    stats: Arc<Mutex<PersistenceStats>>,
    metrics: ForecastMetrics,
    logger: StructuredLogger,
}

impl PersistenceQueue {
    /// Enqueue without blocking
    pub fn submit(&self, record: PredictionRecord) -> PersistStatus {
        let sensor_id = record.sensor_id.clone();
        let status = match self.sender.try_send(record) {
            Ok(()) => PersistStatus::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                PersistStatus::Rejected("persistence queue is full".to_string())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                PersistStatus::Rejected("persistence worker has stopped".to_string())
            }
        };

        if let PersistStatus::Rejected(reason) = &status {
            self.metrics.inc_persistence_failures();
            self.logger.log_persistence_failed(&sensor_id, reason);
        }
        let mut stats = lock_stats(&self.stats);
        match status {
            PersistStatus::Queued => stats.queued += 1,
            _ => stats.rejected += 1,
        }
        drop(stats);
        status
    }

    pub fn stats(&self) -> PersistenceStats {
        lock_stats(&self.stats).clone()
    }
}

fn lock_stats(stats: &Mutex<PersistenceStats>) -> MutexGuard<'_, PersistenceStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consumer side; owns the background task
pub struct PersistenceWorker {
    task: JoinHandle<()>,
    stats: Arc<Mutex<PersistenceStats>>,
}

impl PersistenceWorker {
    /// Spawn the writer task on the current tokio runtime
    pub fn spawn(
        store: Arc<dyn PredictionStore>,
        config: &PersistenceConfig,
        health: Option<HealthRegistry>,
    ) -> (PersistenceQueue, PersistenceWorker) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(Mutex::new(PersistenceStats::default()));
        let metrics = ForecastMetrics::new();
        let logger = StructuredLogger::new("persistence");

        let writer = Writer {
            store,
            receiver,
            write_timeout: config.write_timeout(),
            stats: Arc::clone(&stats),
            metrics: metrics.clone(),
            logger: logger.clone(),
            health,
        };
        let task = tokio::spawn(writer.run());

        (
            PersistenceQueue {
                sender,
                stats: Arc::clone(&stats),
                metrics,
                logger,
            },
            PersistenceWorker { task, stats },
        )
    }

    /// Wait for the queue to drain after every producer has been dropped,
    /// aborting the task if that takes longer than `grace`. Returns the
    /// final counters.
    pub async fn shutdown(self, grace: Duration) -> PersistenceStats {
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            task.abort();
            info!(grace_ms = grace.as_millis() as u64, "Persistence worker aborted");
        }
        let stats = lock_stats(&self.stats).clone();
        stats
    }
}

struct Writer {
    store: Arc<dyn PredictionStore>,
    receiver: mpsc::Receiver<PredictionRecord>,
    write_timeout: Duration,
    stats: Arc<Mutex<PersistenceStats>>,
    metrics: ForecastMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl Writer {
    async fn run(mut self) {
        info!(store = self.store.name(), "Starting persistence worker");
        while let Some(record) = self.receiver.recv().await {
            let outcome = match tokio::time::timeout(self.write_timeout, self.store.save(&record)).await
            {
                Ok(outcome) => outcome,
                Err(_) => PersistOutcome::Failed(format!(
                    "write timed out after {}ms",
                    self.write_timeout.as_millis()
                )),
            };
            self.record_outcome(&record, outcome).await;
        }
        debug!("Persistence queue closed, worker exiting");
    }

    async fn record_outcome(&self, record: &PredictionRecord, outcome: PersistOutcome) {
        match outcome {
            PersistOutcome::Saved => {
                let recovered = {
                    let mut stats = lock_stats(&self.stats);
                    stats.saved += 1;
                    stats.last_error.take().is_some()
                };
                self.metrics.inc_persisted_records();
                debug!(sensor_id = %record.sensor_id, "Prediction record saved");
                if let (true, Some(health)) = (recovered, &self.health) {
                    health.set_healthy(components::PERSISTENCE).await;
                }
            }
            PersistOutcome::Failed(reason) => {
                {
                    let mut stats = lock_stats(&self.stats);
                    stats.failed += 1;
                    stats.last_error = Some(reason.clone());
                }
                self.metrics.inc_persistence_failures();
                self.logger.log_persistence_failed(&record.sensor_id, &reason);
                if let Some(health) = &self.health {
                    health.set_degraded(components::PERSISTENCE, reason).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;

    fn record(sensor: &str) -> PredictionRecord {
        let now = Utc::now();
        PredictionRecord {
            sensor_id: sensor.to_string(),
            prediction_time: now,
            target_time: now,
            flow_prediction: 0.5,
            density_prediction: 0.5,
            congestion_prediction: "clear".to_string(),
            confidence: 0.85,
            model_version: "gru-0badc0de".to_string(),
        }
    }

    struct StalledStore;

    #[async_trait]
    impl PredictionStore for StalledStore {
        async fn save(&self, _record: &PredictionRecord) -> PersistOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            PersistOutcome::Saved
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_records_reach_store() {
        let store = Arc::new(MemoryStore::new());
        let (queue, worker) =
            PersistenceWorker::spawn(store.clone(), &PersistenceConfig::default(), None);

        assert_eq!(queue.submit(record("sensor_001")), PersistStatus::Queued);
        assert_eq!(queue.submit(record("sensor_002")), PersistStatus::Queued);
        drop(queue);
        worker.shutdown(Duration::from_secs(5)).await;

        let saved = store.records().await;
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].sensor_id, "sensor_001");
    }

    #[tokio::test]
    async fn test_failures_degrade_health() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let health = HealthRegistry::new();
        let (queue, worker) = PersistenceWorker::spawn(
            store.clone(),
            &PersistenceConfig::default(),
            Some(health.clone()),
        );

        queue.submit(record("sensor_001"));
        drop(queue);
        let stats = worker.shutdown(Duration::from_secs(5)).await;

        assert_eq!(stats.failed, 1);
        assert!(stats.last_error.is_some());
        let persistence = health.component(components::PERSISTENCE).await.unwrap();
        assert_eq!(persistence.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let config = PersistenceConfig {
            queue_capacity: 1,
            write_timeout_ms: 50,
            ..Default::default()
        };
        let (queue, worker) = PersistenceWorker::spawn(Arc::new(StalledStore), &config, None);

        // The worker holds at most one record in flight and one in the queue
        let statuses: Vec<_> = (0..4).map(|i| queue.submit(record(&format!("sensor_{i:03}")))).collect();
        assert!(statuses
            .iter()
            .any(|s| matches!(s, PersistStatus::Rejected(_))));

        drop(queue);
        worker.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let config = PersistenceConfig {
            write_timeout_ms: 20,
            ..Default::default()
        };
        let (queue, worker) = PersistenceWorker::spawn(Arc::new(StalledStore), &config, None);
        queue.submit(record("sensor_009"));
        drop(queue);
        let stats = worker.shutdown(Duration::from_secs(5)).await;

        assert_eq!(stats.failed, 1);
        assert!(stats.last_error.unwrap().contains("timed out"));
    }
}
