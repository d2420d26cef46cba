mod api;
mod cli;
mod config;
mod db;
mod error;
mod models;
mod services;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "gridiron")]
#[command(about = "NFL odds ingestion, feature building and calibrated game predictions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Run the full pipeline: ingestion, features, predictions, calibration
    Run,
    /// Fetch NFL odds and final scores
    IngestOdds,
    /// Fetch the league injury report
    IngestInjuries,
    /// Fetch kickoff forecasts for upcoming games
    IngestWeather,
    /// Build feature sets for upcoming games
    BuildFeatures,
    /// Generate predictions for upcoming games
    Predict,
    /// Score predictions for completed games
    Evaluate,
    /// Show the calibration report from stored evaluations
    Report {
        /// Also write the reliability curve to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Initialize the database
    InitDb,
    /// Load a demo season into the database
    Seed,
    /// Run the offline stages on in-memory demo data
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port }) => {
            tracing::info!("Starting Gridiron API server on port {}", port);
            api::serve(config, port).await?;
        }
        Some(Commands::Run) => {
            tracing::info!("Running full pipeline...");
            cli::run_stages(&config, &[]).await?;
        }
        Some(Commands::IngestOdds) => cli::ingest_odds(&config).await?,
        Some(Commands::IngestInjuries) => cli::ingest_injuries(&config).await?,
        Some(Commands::IngestWeather) => cli::ingest_weather(&config).await?,
        Some(Commands::BuildFeatures) => cli::build_features(&config).await?,
        Some(Commands::Predict) => cli::generate_predictions(&config).await?,
        Some(Commands::Evaluate) => cli::evaluate(&config).await?,
        Some(Commands::Report { csv }) => cli::report(&config, csv.as_deref()).await?,
        Some(Commands::InitDb) => {
            tracing::info!("Initializing database...");
            cli::init_db(&config).await?;
        }
        Some(Commands::Seed) => cli::seed(&config).await?,
        Some(Commands::Demo) => cli::demo(&config).await?,
        None => {
            // Default to serving
            tracing::info!("Starting Gridiron API server on port 3000");
            api::serve(config, 3000).await?;
        }
    }

    Ok(())
}
