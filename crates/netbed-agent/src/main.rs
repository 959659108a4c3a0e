//! netbed participant agent
//!
//! Runs on every testbed node. Listens for the coordinator's commands,
//! parks until the synchronized start instant arrives, then holds the node
//! in the scenario until a shutdown command tears it down. Exits 0 on a
//! clean shutdown, 1 on configuration or socket errors.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use netbed_core::{
    AbsoluteClock, AgentConfig, AgentHandler, PeerListener, StartGate, TopologyUpdate,
    VirtualClock,
};

/// Participant-node agent for the netbed testbed
#[derive(Parser)]
#[command(name = "netbed-agent")]
#[command(about = "Answer coordinator commands on a testbed node")]
#[command(version)]
struct Cli {
    /// Port to listen on for the coordinator (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Read agent configuration from the specified TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Shared agent state driven by the coordinator's commands.
struct NodeAgent {
    gate: StartGate,
    shutdown_tx: watch::Sender<bool>,
    topology: Mutex<Option<TopologyUpdate>>,
}

impl AgentHandler for NodeAgent {
    fn handle_start(&self, start_time_ms: u64) -> std::result::Result<Option<String>, String> {
        if self.gate.signal(start_time_ms) {
            info!("Got start command for {} ms", start_time_ms);
        } else {
            // the coordinator retries after a lost response; the original
            // start time stays in effect
            warn!(
                "Got duplicate start command for {} ms, keeping {:?}",
                start_time_ms,
                self.gate.start_time()
            );
        }
        Ok(None)
    }

    fn handle_topology_update(
        &self,
        update: TopologyUpdate,
    ) -> std::result::Result<Option<String>, String> {
        debug!(
            "Got topology update with {} nodes and {} links",
            update.nodes.len(),
            update.links.len()
        );
        if let Ok(mut slot) = self.topology.lock() {
            *slot = Some(update);
        }
        Ok(None)
    }

    fn acknowledge_shutdown(&self) -> Option<String> {
        info!("Got shutdown command");
        None
    }

    fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
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
            "netbed_core={},netbed_agent={}",
            log_level, log_level
        ))
        .init();

    info!("netbed-agent version {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("Error reading configuration from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let gate = StartGate::new();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let agent = Arc::new(NodeAgent {
        gate: gate.clone(),
        shutdown_tx,
        topology: Mutex::new(None),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = PeerListener::bind(addr, agent, config.shutdown_grace())
        .await
        .with_context(|| format!("Error listening on {}", addr))?;
    tokio::spawn(async move {
        if let Err(e) = listener.serve().await {
            warn!("Listener exited: {}", e);
        }
    });

    // a shutdown before start skips the scenario entirely
    info!("Waiting for the start command");
    let start_time_ms = tokio::select! {
        time = gate.wait() => time,
        _ = shutdown_rx.changed() => {
            info!("Shutdown before start, exiting");
            return Ok(());
        }
    };

    let clock = AbsoluteClock::new();
    clock.start();
    info!(
        "Waiting until {} ms to participate in the scenario",
        start_time_ms
    );
    clock.wait_until(start_time_ms).await;
    info!("Scenario started, running until shutdown");

    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }

    info!("Shutting down");
    Ok(())
}
