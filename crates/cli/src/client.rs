//! API client for a running `traffic-server`

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forecast_lib::health::{HealthResponse, ReadinessResponse};
use forecast_lib::persistence::PersistStatus;
use forecast_lib::SensorStatistics;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for the forecast server
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send_get(path, &[]).await?;
        Self::decode(response).await
    }

    async fn send_get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let url = self.base_url.join(path).context("Invalid path")?;
        self.client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Liveness; the body is returned for 503 as well as 200
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.send_get("healthz", &[]).await?;
        match response.status() {
            StatusCode::OK | StatusCode::SERVICE_UNAVAILABLE => {
                response.json().await.context("Failed to parse health response")
            }
            _ => Self::decode(response).await,
        }
    }

    /// Readiness; the body is returned for 503 as well as 200
    pub async fn readiness(&self) -> Result<ReadinessResponse> {
        let response = self.send_get("readyz", &[]).await?;
        match response.status() {
            StatusCode::OK | StatusCode::SERVICE_UNAVAILABLE => response
                .json()
                .await
                .context("Failed to parse readiness response"),
            _ => Self::decode(response).await,
        }
    }

    pub async fn demo(&self, sensor_id: Option<&str>, persist: Option<bool>) -> Result<DemoResponse> {
        let mut query = Vec::new();
        if let Some(id) = sensor_id {
            query.push(("sensor_id", id.to_string()));
        }
        if let Some(persist) = persist {
            query.push(("persist", persist.to_string()));
        }
        let response = self.send_get("predict/demo", &query).await?;
        Self::decode(response).await
    }

    pub async fn sensor_stats(&self, index: usize) -> Result<SensorStatistics> {
        self.get(&format!("sensors/{index}/stats")).await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoResponse {
    pub sensor_id: String,
    pub sensor_index: usize,
    pub time_index: usize,
    pub flow_prediction: f32,
    pub density_prediction: f32,
    pub congestion_status: u8,
    pub congestion_level: String,
    pub confidence: f32,
    pub prediction_time: DateTime<Utc>,
    pub target_time: DateTime<Utc>,
    pub model_type: String,
    pub model_version: String,
    pub persistence: PersistStatus,
    pub input_data: Vec<Vec<f32>>,
    pub sensor_stats: SensorStatistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}
