//! Traffic Flow Forecaster CLI
//!
//! Trains and evaluates models, runs local predictions against the sensor
//! dataset, and queries a running forecast server.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::inspect::SampleArgs;
use commands::train::TrainArgs;
use commands::{inspect, remote, train};
use forecast_lib::model::ModelKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Traffic Flow Forecaster CLI
#[derive(Parser)]
#[command(name = "tfp")]
#[command(author, version, about = "CLI for the Traffic Flow Forecaster", long_about = None)]
pub struct Cli {
    /// Server URL for remote commands (can also be set via TFP_API_URL env var)
    #[arg(long, env = "TFP_API_URL", default_value = "http://localhost:8000", global = true)]
    pub api_url: String,

    /// Configuration file for local commands (TOML, YAML or JSON)
    #[arg(long, short, env = "TFP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a model and save its best checkpoint
    Train {
        /// Dataset: .npz, .npy or a directory
        #[arg(long)]
        data: PathBuf,

        /// Recurrent cell (lstm or gru)
        #[arg(long)]
        model: Option<ModelKind>,

        /// Maximum number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Output directory for checkpoints, scalers and run records
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Evaluate a checkpoint on the held-out test split
    Evaluate {
        /// Dataset: .npz, .npy or a directory
        #[arg(long)]
        data: PathBuf,

        /// Checkpoint file (.safetensors)
        #[arg(long)]
        checkpoint: PathBuf,
    },

    /// Predict congestion for a sampled sensor window
    Predict {
        /// Checkpoint file (.safetensors)
        #[arg(long)]
        checkpoint: PathBuf,

        #[command(flatten)]
        window: WindowArgs,
    },

    /// Print a sampled sensor window
    Sample {
        #[command(flatten)]
        window: WindowArgs,
    },

    /// Show historical statistics for a sensor
    Stats {
        /// Dataset: .npz, .npy or a directory
        #[arg(long)]
        data: PathBuf,

        /// Sensor index
        #[arg(long)]
        sensor: usize,
    },

    /// Query a running forecast server
    #[command(subcommand)]
    Remote(RemoteCommands),
}

#[derive(clap::Args)]
pub struct WindowArgs {
    /// Dataset: .npz, .npy or a directory
    #[arg(long)]
    data: PathBuf,

    /// Fitted scalers written by `train` (scalers.json)
    #[arg(long)]
    scalers: Option<PathBuf>,

    /// Sensor id (sensor_003 or 3); random when omitted
    #[arg(long)]
    sensor: Option<String>,

    /// Window length in timesteps
    #[arg(long)]
    lookback: Option<usize>,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
}

impl From<WindowArgs> for SampleArgs {
    fn from(args: WindowArgs) -> Self {
        SampleArgs {
            data: args.data,
            scalers: args.scalers,
            sensor: args.sensor,
            lookback: args.lookback,
            seed: args.seed,
        }
    }
}

#[derive(Subcommand)]
pub enum RemoteCommands {
    /// Show server health and readiness
    Health,

    /// Predict on a window sampled by the server
    Demo {
        /// Sensor id (sensor_003 or 3); random when omitted
        #[arg(long)]
        sensor: Option<String>,

        /// Override whether the server stores the prediction
        #[arg(long)]
        persist: Option<bool>,
    },

    /// Show statistics for a sensor of the server's dataset
    Stats {
        /// Sensor index
        #[arg(long)]
        sensor: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let load_config = || config::CliConfig::load(cli.config.as_deref());
    match cli.command {
        Commands::Train {
            data,
            model,
            epochs,
            out,
        } => {
            let args = TrainArgs {
                data,
                model,
                epochs,
                out,
            };
            train::train(args, load_config()?, cli.format).await?;
        }
        Commands::Evaluate { data, checkpoint } => {
            train::evaluate(&data, &checkpoint, load_config()?, cli.format).await?;
        }
        Commands::Predict { checkpoint, window } => {
            inspect::predict(window.into(), checkpoint, load_config()?, cli.format).await?;
        }
        Commands::Sample { window } => {
            inspect::sample(window.into(), load_config()?, cli.format).await?;
        }
        Commands::Stats { data, sensor } => inspect::stats(data, sensor, cli.format).await?,
        Commands::Remote(remote_cmd) => {
            let client = client::ApiClient::new(&cli.api_url)?;
            match remote_cmd {
                RemoteCommands::Health => remote::health(&client, cli.format).await?,
                RemoteCommands::Demo { sensor, persist } => {
                    remote::demo(&client, sensor.as_deref(), persist, cli.format).await?
                }
                RemoteCommands::Stats { sensor } => {
                    remote::sensor_stats(&client, sensor, cli.format).await?
                }
            }
        }
    }

    Ok(())
}
