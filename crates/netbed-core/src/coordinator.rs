//! Scenario coordinator
//!
//! Owns one experiment run end to end: connect to every participant,
//! broadcast the initial topology, distribute the synchronized start
//! instant, then drive the scripted failure timeline against the simulation
//! clock. Connection setup and the start phases are all-or-nothing, so a
//! scenario is never partially started; per-event failures are logged and
//! skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::{AbsoluteClock, SimulationClock, VirtualClock};
use crate::config::DriverConfig;
use crate::connection::PeerConnection;
use crate::errors::CoordinationError;
use crate::identity::NodeName;
use crate::retry::retry_fixed;
use crate::scenario::{ControlNames, NodeFailure, Scenario};
use crate::topology::{TopologyGraph, TopologyUpdate};
use crate::Result;

/// Cooperative stop signal for a running coordinator. Checked before each
/// wait and each scheduled event in the failure timeline.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives one scenario across all connected peers.
pub struct ScenarioCoordinator {
    config: DriverConfig,
    graph: Arc<Mutex<TopologyGraph>>,
    compute_peers: HashMap<NodeName, Arc<PeerConnection>>,
    client_peers: HashMap<NodeName, Arc<PeerConnection>>,
    traffic_peers: HashMap<NodeName, Arc<PeerConnection>>,
    failures: Vec<NodeFailure>,
    stop: StopFlag,
}

impl ScenarioCoordinator {
    /// Connect to every node in the scenario and seed the initial topology.
    ///
    /// Each role category connects in parallel (one worker per node, joined
    /// before moving on). Setup is all-or-nothing: any node that exhausts
    /// its connection budget aborts construction.
    pub async fn connect(
        scenario: &Scenario,
        control_names: &ControlNames,
        config: DriverConfig,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            "Connecting to {} compute nodes, {} clients, {} traffic generators",
            scenario.compute_nodes.len(),
            scenario.clients.len(),
            scenario.compute_nodes.len() + scenario.clients.len()
        );

        let compute_peers = connect_category(
            "compute node",
            scenario.compute_nodes.iter(),
            control_names,
            config.coordination_port,
            &config,
        )
        .await?;

        let client_peers = connect_category(
            "client",
            scenario.clients.iter(),
            control_names,
            config.coordination_port,
            &config,
        )
        .await?;

        // traffic generators run on every node, on the offset port
        let traffic_peers = connect_category(
            "traffic generator",
            scenario.all_nodes(),
            control_names,
            config.traffic_generator_port,
            &config,
        )
        .await?;

        let coordinator = ScenarioCoordinator {
            config,
            graph: Arc::new(Mutex::new(scenario.graph.clone())),
            compute_peers,
            client_peers,
            traffic_peers,
            failures: scenario.failures.clone(),
            stop: StopFlag::default(),
        };

        // make sure every compute node has a current topology before any
        // start command can arrive
        coordinator.broadcast_topology().await;

        Ok(coordinator)
    }

    /// Handle for asking a running coordinator to stop between events.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn is_compute_peer(&self, node: &NodeName) -> bool {
        self.compute_peers.contains_key(node)
    }

    pub async fn topology_snapshot(&self) -> TopologyUpdate {
        self.graph.lock().await.snapshot()
    }

    /// Run the scenario: distribute the start instant, wait for it on the
    /// absolute clock, then drive the failure timeline on the simulation
    /// clock. Does not close connections; see
    /// [`ScenarioCoordinator::disconnect_all`].
    pub async fn execute(&mut self) -> Result<()> {
        info!("Top of run for the scenario coordinator");

        let global_clock = AbsoluteClock::new();
        global_clock.start();
        let global_now = global_clock.now();

        // absolute times so that NTP-synchronized peers resolve the same
        // instant
        let algorithm_start = global_now + self.config.algorithm_start_wait_ms;
        let client_start = algorithm_start + self.config.client_start_wait_ms;
        info!(
            "Algorithms start at {} ms, clients at {} ms",
            algorithm_start, client_start
        );

        self.start_phase("compute nodes", self.compute_peers.values(), client_start)
            .await?;

        // only reached when every compute node acknowledged start
        self.start_phase(
            "clients and traffic generators",
            self.client_peers.values().chain(self.traffic_peers.values()),
            client_start,
        )
        .await?;

        info!("Waiting until the client start time to begin the scenario");
        global_clock.wait_until(client_start).await;

        info!("Starting the failure timeline");
        let simulation_clock = SimulationClock::new();
        simulation_clock.start();
        self.simulate_failures(&simulation_clock).await;

        info!("Finished scenario coordinator");
        Ok(())
    }

    /// Release every peer connection. Separate from [`execute`] so results
    /// can still be collected from peers after the timeline completes.
    pub async fn disconnect_all(&mut self) {
        let all = self
            .compute_peers
            .drain()
            .chain(self.client_peers.drain())
            .chain(self.traffic_peers.drain());
        join_all(all.map(|(_, conn)| async move { conn.disconnect().await })).await;
    }

    /// Send START to every peer in the phase, in parallel, each with the
    /// configured retry budget. All peers must acknowledge or the phase
    /// fails and the scenario does not advance.
    async fn start_phase<'a>(
        &self,
        phase: &'static str,
        peers: impl Iterator<Item = &'a Arc<PeerConnection>>,
        start_time_ms: u64,
    ) -> Result<()> {
        let policy = self.config.start_policy();

        let attempts = peers
            .map(|conn| {
                let conn = Arc::clone(conn);
                async move {
                    debug!("{}: sending start to {}:{}", phase, conn.node(), conn.port());
                    let outcome = retry_fixed(policy, |attempt| {
                        let conn = Arc::clone(&conn);
                        async move {
                            if conn.send_start(start_time_ms).await {
                                Ok(())
                            } else {
                                warn!(
                                    "Got error sending start to {}:{}, trying again (attempt {})",
                                    conn.node(),
                                    conn.port(),
                                    attempt
                                );
                                Err(())
                            }
                        }
                    })
                    .await;

                    if outcome.is_err() {
                        error!(
                            "All attempts to send start to {}:{} failed",
                            conn.node(),
                            conn.port()
                        );
                    }
                    outcome.is_ok()
                }
            })
            .collect::<Vec<_>>();

        if join_all(attempts).await.into_iter().all(|ok| ok) {
            Ok(())
        } else {
            error!("Some {} failed to get the start message, aborting", phase);
            Err(CoordinationError::StartPhaseFailed { phase })
        }
    }

    /// One pass over the scripted failures, in trigger-time order, against
    /// the given simulation clock.
    async fn simulate_failures(&mut self, clock: &SimulationClock) {
        // bounded pool for fire-and-forget shutdowns: one unresponsive node
        // must not delay later scheduled failures
        let pool = Arc::new(Semaphore::new(self.config.shutdown_pool_size));

        let failures = self.failures.clone();
        for failure in failures {
            debug!("Waiting for failure time {}", failure.time);
            if self.stop.is_stopped() {
                info!("Exiting failure timeline due to coordinator stop (before wait)");
                return;
            }
            clock.wait_until(failure.time).await;
            if self.stop.is_stopped() {
                info!("Exiting failure timeline due to coordinator stop (after wait)");
                return;
            }

            if failure.nodes.is_empty() {
                warn!(
                    "Found node failure at {} with no nodes, skipping",
                    failure.time
                );
                continue;
            }

            let node = choose_node_to_fail(&failure);
            match self.compute_peers.remove(&node) {
                Some(conn) => {
                    info!("Simulating failure on node {}", node);

                    let pool = Arc::clone(&pool);
                    let failed = node.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = pool.acquire_owned().await else {
                            return;
                        };
                        debug!("Sending shutdown command to {}", failed);
                        let result = conn.send_shutdown().await;
                        debug!("Got shutdown result from {} of {}", failed, result);
                    });

                    // the lock is never held across a network call
                    {
                        let mut graph = self.graph.lock().await;
                        graph.remove_node(&node);
                    }
                    self.broadcast_topology().await;
                }
                None => {
                    error!("Unable to find {} as a running compute node", node);
                }
            }
        }
        info!("All simulated failures executed, exiting failure timeline");
    }

    /// Fan a fresh full topology snapshot out to every remaining compute
    /// node. Per-peer failures are logged; they never block the other sends.
    async fn broadcast_topology(&self) {
        let update = self.graph.lock().await.snapshot();

        let peers: Vec<Arc<PeerConnection>> = self.compute_peers.values().cloned().collect();
        let sends = peers.into_iter().map(|conn| {
            let update = update.clone();
            async move {
                let result = conn.send_topology_update(&update).await;
                debug!(
                    "Result of sending topology update to {}: {}",
                    conn.node(),
                    result
                );
            }
        });
        join_all(sends).await;
    }
}

/// Deterministic first-candidate selection. Choosing among multiple
/// candidates by an algorithm is unsupported; callers guarantee the list is
/// non-empty.
fn choose_node_to_fail(failure: &NodeFailure) -> NodeName {
    if failure.nodes.len() > 1 {
        warn!(
            "Choosing a node based on an algorithm is currently unsupported, \
             the first node in the list will be shut down"
        );
    }
    failure.nodes[0].clone()
}

/// Connect one role category in parallel: one worker per node, joined at a
/// barrier, all-or-nothing.
async fn connect_category(
    role: &'static str,
    nodes: impl Iterator<Item = &NodeName>,
    control_names: &ControlNames,
    port: u16,
    config: &DriverConfig,
) -> Result<HashMap<NodeName, Arc<PeerConnection>>> {
    let policy = config.connect_policy();
    let command_timeout = config.command_timeout();

    let workers = nodes
        .map(|node| {
            let node = node.clone();
            let (host, port) = control_names.resolve(&node, port);
            async move {
                debug!("Creating connection to {} {}", role, node);
                PeerConnection::connect(node, &host, port, policy, command_timeout).await
            }
        })
        .collect::<Vec<_>>();

    let mut peers = HashMap::new();
    for conn in join_all(workers).await {
        if !conn.is_connected().await {
            return Err(CoordinationError::NodeUnreachable {
                node: conn.node().clone(),
            });
        }
        peers.insert(conn.node().clone(), Arc::new(conn));
    }
    Ok(peers)
}
