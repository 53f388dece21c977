//! Traffic forecast server
//!
//! Loads the configured checkpoint and sensor dataset, then serves health,
//! metrics and prediction routes until SIGINT.

use anyhow::{Context, Result};
use candle_core::Device;
use forecast_lib::{
    health::{components, HealthRegistry},
    observability::{ForecastMetrics, StructuredLogger},
    persistence::PersistenceWorker,
    predictor::{LoadedModel, ModelHandle, Predictor, SensorSampler},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use traffic_server::{api, AppState, ServerConfig};

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time the persistence worker gets to drain after the listener stops
const PERSISTENCE_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = ServerConfig::load().context("Failed to load configuration")?;
    info!(port = config.port, model_path = %config.model_path.display(), "Server configured");

    let health_registry = HealthRegistry::new();
    let metrics = ForecastMetrics::new();
    let logger = StructuredLogger::new("server");

    // A missing checkpoint leaves the server up but not ready
    let handle = match LoadedModel::load(&config.model_path, &Device::Cpu) {
        Ok(model) => {
            health_registry.set_healthy(components::MODEL).await;
            ModelHandle::with_model(model)
        }
        Err(e) => {
            warn!(error = %e, path = %config.model_path.display(), "Starting without a model");
            health_registry
                .set_unhealthy(components::MODEL, e.to_string())
                .await;
            ModelHandle::empty()
        }
    };
    let model_version = handle.current().ok().map(|m| m.version.clone());

    let sampler = match SensorSampler::open(&config.sampler) {
        Ok(sampler) => {
            info!(
                sensors = sampler.num_sensors(),
                timesteps = sampler.series().num_timesteps(),
                "Sensor dataset loaded"
            );
            health_registry.set_healthy(components::DATASET).await;
            Some(sampler)
        }
        Err(e) => {
            warn!(error = %e, "Sensor dataset unavailable; demo and stats routes disabled");
            health_registry
                .set_degraded(components::DATASET, e.to_string())
                .await;
            None
        }
    };

    let (queue, worker) = if config.persistence.enabled {
        let (queue, worker) = PersistenceWorker::spawn(
            config.persistence.open_store(),
            &config.persistence,
            Some(health_registry.clone()),
        );
        health_registry.set_healthy(components::PERSISTENCE).await;
        (Some(queue), Some(worker))
    } else {
        info!("Prediction persistence disabled");
        (None, None)
    };

    let predictor = Predictor::new(handle, config.predictor.clone(), queue)
        .context("Invalid predictor configuration")?;

    let state = Arc::new(AppState {
        health_registry: health_registry.clone(),
        metrics,
        predictor,
        sampler,
        lookback: config.sampler.lookback,
        persist_demo_predictions: config.persist_demo_predictions,
    });

    health_registry.set_ready(true).await;
    logger.log_startup(SERVER_VERSION, model_version.as_deref());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
        }
    };
    let served = api::serve(config.port, state, shutdown).await;
    logger.log_shutdown("SIGINT received");

    // The router, and with it the last queue sender, is gone once serve returns
    if let Some(worker) = worker {
        let stats = worker.shutdown(PERSISTENCE_GRACE).await;
        info!(
            saved = stats.saved,
            failed = stats.failed,
            rejected = stats.rejected,
            "Persistence worker stopped"
        );
    }

    served
}
