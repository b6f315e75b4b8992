//! Main Entrypoint for the Tutoring Simulator
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Parsing and validating the command line.
//! 4. Running the simulation and reporting where results were written.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tutorsim_simulator::{cli::Cli, config::Config, pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    // --- 3. Parse Arguments ---
    let cli = Cli::parse();
    info!(
        version = %cli.version,
        user_model = %cli.user_model,
        assistant_model = %cli.assistant_model(),
        max_workers = config.max_workers,
        rate_limit_per_minute = config.rate_limit_per_minute,
        "Configuration loaded. Starting simulation..."
    );

    // --- 4. Run ---
    let path = pipeline::run(&config, &cli).await?;
    info!(path = %path.display(), "Simulation finished.");
    Ok(())
}
