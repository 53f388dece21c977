//! Commands against a running forecast server

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::commands::inspect::print_statistics;
use crate::output::{
    color_confidence, color_congestion, color_status, format_float, print_field, print_heading,
    print_json, print_table, print_warning, OutputFormat,
};
use forecast_lib::health::{HealthResponse, ReadinessResponse};
use forecast_lib::persistence::PersistStatus;

/// Row for component health table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

#[derive(Serialize)]
struct HealthOutput {
    health: HealthResponse,
    readiness: ReadinessResponse,
}

fn status_name<T: Serialize>(status: &T) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Show server liveness, readiness and per-component health
pub async fn health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;
    let readiness = client.readiness().await?;

    match format {
        OutputFormat::Json => print_json(&HealthOutput { health, readiness })?,
        OutputFormat::Table => {
            print_heading("Server Health");
            print_field("Status", color_status(&status_name(&health.status)));
            let ready = if readiness.ready {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            };
            print_field("Ready", ready);
            if let Some(reason) = &readiness.reason {
                print_field("Reason", reason);
            }
            println!();

            let rows: Vec<ComponentRow> = health
                .components
                .iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&status_name(&c.status)),
                    message: c.message.clone().unwrap_or_else(|| "-".to_string()),
                    updated: c.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
                .collect();
            print_table(&rows);
        }
    }
    Ok(())
}

fn persistence_text(status: &PersistStatus) -> String {
    match status {
        PersistStatus::NotRequested => color_status("not_requested"),
        PersistStatus::Queued => color_status("queued"),
        PersistStatus::Rejected(reason) => format!("{} ({reason})", color_status("rejected")),
    }
}

/// Ask the server for a prediction on a sampled window
pub async fn demo(
    client: &ApiClient,
    sensor: Option<&str>,
    persist: Option<bool>,
    format: OutputFormat,
) -> Result<()> {
    let demo = client.demo(sensor, persist).await?;

    match format {
        OutputFormat::Json => print_json(&demo)?,
        OutputFormat::Table => {
            print_heading("Demo Prediction");
            print_field("Sensor", &demo.sensor_id);
            print_field("Window start", demo.time_index);
            print_field("Model", format!("{} ({})", demo.model_type, demo.model_version));
            print_field("Flow", format_float(demo.flow_prediction as f64));
            print_field("Density", format_float(demo.density_prediction as f64));
            print_field(
                "Congestion",
                color_congestion(demo.congestion_status, &demo.congestion_level),
            );
            print_field("Confidence", color_confidence(demo.confidence));
            print_field("Target time", demo.target_time.to_rfc3339());
            print_field("Persistence", persistence_text(&demo.persistence));
            if let PersistStatus::Rejected(_) = demo.persistence {
                print_warning("The prediction was served but not stored");
            }
            println!();
            print_statistics(&demo.sensor_stats, format)?;
        }
    }
    Ok(())
}

/// Statistics for one sensor of the server's dataset
pub async fn sensor_stats(client: &ApiClient, sensor: usize, format: OutputFormat) -> Result<()> {
    let stats = client.sensor_stats(sensor).await?;
    print_statistics(&stats, format)
}
