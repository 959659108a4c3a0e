//! netbed scenario driver
//!
//! Connects to every participant node of a scenario, distributes the
//! synchronized start instant, and injects the scripted node failures.
//! Exits 0 on clean completion, 1 on configuration errors or when any node
//! cannot be reached during setup.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use netbed_core::{ControlNames, DriverConfig, Scenario, ScenarioCoordinator};

/// Drive a scripted scenario across the testbed
#[derive(Parser)]
#[command(name = "netbed-driver")]
#[command(about = "Drive a scripted scenario across the netbed testbed")]
#[command(version)]
struct Cli {
    /// Directory to read the scenario from
    #[arg(long)]
    scenario_dir: PathBuf,

    /// Read driver configuration from the specified TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON map from node name to control-network hostname
    #[arg(long)]
    control_names: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // help/version exit 0; a bad command line exits 1
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(if e.use_stderr() { 1 } else { 0 });
    });

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "netbed_core={},netbed_driver={}",
            log_level, log_level
        ))
        .init();

    info!("netbed-driver version {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => DriverConfig::load(path)
            .with_context(|| format!("Error reading configuration from {}", path.display()))?,
        None => DriverConfig::default(),
    };

    let control_names = match &cli.control_names {
        Some(path) => ControlNames::load(path)
            .with_context(|| format!("Error reading control names from {}", path.display()))?,
        None => ControlNames::default(),
    };

    let scenario = Scenario::load(&cli.scenario_dir).with_context(|| {
        format!("Error reading scenario from {}", cli.scenario_dir.display())
    })?;

    let mut coordinator = ScenarioCoordinator::connect(&scenario, &control_names, config)
        .await
        .context("Error connecting to scenario nodes")?;

    // Ctrl-C stops the failure timeline between events
    let stop = coordinator.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested, exiting after the current event");
            stop.request_stop();
        }
    });

    coordinator.execute().await?;
    coordinator.disconnect_all().await;

    info!("Scenario complete");
    Ok(())
}
