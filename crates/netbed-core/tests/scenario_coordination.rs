//! Coordination Integration Tests
//!
//! End-to-end tests running a real coordinator against in-process peer
//! listeners over loopback: connection setup, the all-or-nothing start
//! phases, the scripted failure timeline, and the listener's handling of
//! malformed traffic.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use netbed_core::protocol::JsonStream;
use netbed_core::{
    AgentHandler, ControlNames, ControlRequest, ControlResponse, CoordinationError, DriverConfig,
    NodeFailure, NodeName, PeerListener, Scenario, ScenarioCoordinator, StartGate, TopologyGraph,
    TopologyUpdate,
};

// ----------------------------------------------------------------------------
// Test Fixtures
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(u64),
    /// Node and link counts of a received topology snapshot.
    Topology(usize, usize),
    /// SHUTDOWN acknowledged on the wire.
    Shutdown,
    /// Host teardown invoked after the grace period.
    Teardown,
}

type EventLog = Arc<Mutex<Vec<(NodeName, Event)>>>;

/// Handler that records every command it sees in a shared log. The start
/// gate gives it the same duplicate-start behavior as a real agent.
struct RecordingAgent {
    node: NodeName,
    gate: StartGate,
    reject_start: bool,
    log: EventLog,
}

impl RecordingAgent {
    fn record(&self, event: Event) {
        if let Ok(mut log) = self.log.lock() {
            log.push((self.node.clone(), event));
        }
    }
}

impl AgentHandler for RecordingAgent {
    fn handle_start(&self, start_time_ms: u64) -> Result<Option<String>, String> {
        if self.reject_start {
            return Err("start rejected".to_owned());
        }
        if self.gate.signal(start_time_ms) {
            self.record(Event::Start(start_time_ms));
        }
        Ok(None)
    }

    fn handle_topology_update(&self, update: TopologyUpdate) -> Result<Option<String>, String> {
        self.record(Event::Topology(update.nodes.len(), update.links.len()));
        Ok(None)
    }

    fn acknowledge_shutdown(&self) -> Option<String> {
        self.record(Event::Shutdown);
        None
    }

    fn trigger_shutdown(&self) {
        self.record(Event::Teardown);
    }
}

/// Start a recording listener on an OS-assigned loopback port.
async fn spawn_agent(
    name: &str,
    log: &EventLog,
    reject_start: bool,
    shutdown_grace: Duration,
) -> (NodeName, u16) {
    let node = NodeName::new(name);
    let handler = Arc::new(RecordingAgent {
        node: node.clone(),
        gate: StartGate::new(),
        reject_start,
        log: Arc::clone(log),
    });

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = PeerListener::bind(addr, handler, shutdown_grace)
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = listener.serve().await;
    });
    (node, port)
}

/// A loopback port that nothing is listening on.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn test_config() -> DriverConfig {
    DriverConfig {
        connect_attempts: 3,
        connect_retry_ms: 20,
        start_attempts: 2,
        start_retry_ms: 20,
        command_timeout_ms: 2_000,
        algorithm_start_wait_ms: 50,
        client_start_wait_ms: 50,
        shutdown_pool_size: 2,
        ..DriverConfig::default()
    }
}

fn new_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

const GRACE: Duration = Duration::from_millis(20);

// ----------------------------------------------------------------------------
// Setup
// ----------------------------------------------------------------------------

#[tokio::test]
async fn setup_aborts_when_any_node_is_unreachable() {
    let log = new_log();
    let (good, good_port) = spawn_agent("good", &log, false, GRACE).await;
    let ghost = NodeName::new("ghost");
    let ghost_port = dead_port().await;

    let mut graph = TopologyGraph::new();
    graph.add_node(good.clone());
    graph.add_node(ghost.clone());
    let scenario = Scenario::new(
        graph,
        vec![good.clone(), ghost.clone()],
        Vec::new(),
        Vec::new(),
    );

    let mut names = ControlNames::default();
    names.insert(good, format!("127.0.0.1:{}", good_port));
    names.insert(ghost, format!("127.0.0.1:{}", ghost_port));

    let result = ScenarioCoordinator::connect(&scenario, &names, test_config()).await;
    assert!(matches!(
        result,
        Err(CoordinationError::NodeUnreachable { .. })
    ));
}

// ----------------------------------------------------------------------------
// Start Phases
// ----------------------------------------------------------------------------

#[tokio::test]
async fn failed_compute_start_keeps_clients_unstarted() {
    let log = new_log();
    let (good, good_port) = spawn_agent("good", &log, false, GRACE).await;
    let (bad, bad_port) = spawn_agent("bad", &log, true, GRACE).await;
    let (client, client_port) = spawn_agent("clientx", &log, false, GRACE).await;

    let mut graph = TopologyGraph::new();
    graph.add_node(client.clone());
    graph.add_link(good.clone(), bad.clone());
    let scenario = Scenario::new(
        graph,
        vec![good.clone(), bad.clone()],
        vec![client.clone()],
        Vec::new(),
    );

    let mut names = ControlNames::default();
    names.insert(good, format!("127.0.0.1:{}", good_port));
    names.insert(bad, format!("127.0.0.1:{}", bad_port));
    names.insert(client.clone(), format!("127.0.0.1:{}", client_port));

    let mut coordinator = ScenarioCoordinator::connect(&scenario, &names, test_config())
        .await
        .unwrap();

    let result = coordinator.execute().await;
    assert!(matches!(
        result,
        Err(CoordinationError::StartPhaseFailed { .. })
    ));
    coordinator.disconnect_all().await;

    // the client phase never ran, so no client ever saw a start command
    let log = log.lock().unwrap();
    assert!(log
        .iter()
        .all(|(node, event)| !(node == &client && matches!(event, Event::Start(_)))));
}

// ----------------------------------------------------------------------------
// Failure Timeline
// ----------------------------------------------------------------------------

#[tokio::test]
async fn scripted_failures_shrink_the_broadcast_topology() {
    let log = new_log();
    let (a, a_port) = spawn_agent("alpha", &log, false, GRACE).await;
    let (b, b_port) = spawn_agent("beta", &log, false, GRACE).await;
    let (c, c_port) = spawn_agent("gamma", &log, false, GRACE).await;

    let mut graph = TopologyGraph::new();
    graph.add_link(a.clone(), b.clone());
    graph.add_link(a.clone(), c.clone());
    graph.add_link(b.clone(), c.clone());
    let scenario = Scenario::new(
        graph,
        vec![a.clone(), b.clone(), c.clone()],
        Vec::new(),
        vec![
            NodeFailure {
                time: 300,
                nodes: vec![b.clone()],
            },
            NodeFailure {
                time: 100,
                nodes: vec![a.clone()],
            },
        ],
    );

    let mut names = ControlNames::default();
    names.insert(a.clone(), format!("127.0.0.1:{}", a_port));
    names.insert(b.clone(), format!("127.0.0.1:{}", b_port));
    names.insert(c.clone(), format!("127.0.0.1:{}", c_port));

    let mut coordinator = ScenarioCoordinator::connect(&scenario, &names, test_config())
        .await
        .unwrap();
    coordinator.execute().await.unwrap();

    // shutdown sends run on background workers; give them time to land
    tokio::time::sleep(Duration::from_millis(200)).await;
    coordinator.disconnect_all().await;

    let log = log.lock().unwrap();

    // the surviving node watched the topology shrink, one full snapshot per
    // failure, ending with itself alone
    let seen_by_c: Vec<(usize, usize)> = log
        .iter()
        .filter_map(|(node, event)| match event {
            Event::Topology(nodes, links) if node == &c => Some((*nodes, *links)),
            _ => None,
        })
        .collect();
    assert_eq!(seen_by_c, vec![(3, 3), (2, 1), (1, 0)]);

    // the scripted nodes were shut down; the survivor was not
    assert!(log.iter().any(|(n, e)| n == &a && *e == Event::Shutdown));
    assert!(log.iter().any(|(n, e)| n == &b && *e == Event::Shutdown));
    assert!(!log.iter().any(|(n, e)| n == &c && *e == Event::Shutdown));

    // the first node's shutdown landed before the broadcast that followed
    // the second removal
    let first_shutdown = log
        .iter()
        .position(|(n, e)| n == &a && *e == Event::Shutdown)
        .unwrap();
    let last_broadcast = log
        .iter()
        .position(|(n, e)| n == &c && *e == Event::Topology(1, 0))
        .unwrap();
    assert!(first_shutdown < last_broadcast);
}

// ----------------------------------------------------------------------------
// Listener Robustness
// ----------------------------------------------------------------------------

#[tokio::test]
async fn listener_survives_unknown_and_malformed_requests() {
    let log = new_log();
    let (_node, port) = spawn_agent("nodea", &log, false, GRACE).await;

    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = JsonStream::new(socket);

    // unknown kind is answered, not dropped
    stream
        .send(&serde_json::json!({ "type": "FROBNICATE" }))
        .await
        .unwrap();
    let response: ControlResponse = stream.recv().await.unwrap().unwrap();
    assert!(!response.is_ok());
    assert_eq!(
        response.message.as_deref(),
        Some("Unknown request: FROBNICATE")
    );

    // missing and malformed payloads are answered too
    stream
        .send(&serde_json::json!({ "type": "START" }))
        .await
        .unwrap();
    let response: ControlResponse = stream.recv().await.unwrap().unwrap();
    assert!(!response.is_ok());

    stream
        .send(&serde_json::json!({ "type": "START", "payload": "soon" }))
        .await
        .unwrap();
    let response: ControlResponse = stream.recv().await.unwrap().unwrap();
    assert!(!response.is_ok());

    // the same connection still serves well-formed requests
    let update = TopologyUpdate {
        nodes: vec!["nodea".to_owned()],
        links: Vec::new(),
    };
    stream
        .send(&ControlRequest::topology_update(&update).unwrap())
        .await
        .unwrap();
    let response: ControlResponse = stream.recv().await.unwrap().unwrap();
    assert!(response.is_ok());

    // duplicate start is acknowledged but keeps the first start time
    stream.send(&ControlRequest::start(5_000)).await.unwrap();
    let response: ControlResponse = stream.recv().await.unwrap().unwrap();
    assert!(response.is_ok());

    stream.send(&ControlRequest::start(9_000)).await.unwrap();
    let response: ControlResponse = stream.recv().await.unwrap().unwrap();
    assert!(response.is_ok());

    let log = log.lock().unwrap();
    let starts: Vec<&Event> = log
        .iter()
        .filter_map(|(_, e)| matches!(e, Event::Start(_)).then_some(e))
        .collect();
    assert_eq!(starts, vec![&Event::Start(5_000)]);
}

#[tokio::test]
async fn shutdown_is_acknowledged_before_teardown() {
    let log = new_log();
    let grace = Duration::from_millis(100);
    let (node, port) = spawn_agent("nodea", &log, false, grace).await;

    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = JsonStream::new(socket);

    stream.send(&ControlRequest::shutdown()).await.unwrap();
    let response: ControlResponse = stream.recv().await.unwrap().unwrap();
    assert!(response.is_ok());

    // acknowledged on the wire, teardown still pending
    {
        let log = log.lock().unwrap();
        assert!(log.iter().any(|(n, e)| n == &node && *e == Event::Shutdown));
        assert!(!log.iter().any(|(n, e)| n == &node && *e == Event::Teardown));
    }

    tokio::time::sleep(grace + Duration::from_millis(100)).await;
    let log = log.lock().unwrap();
    assert!(log.iter().any(|(n, e)| n == &node && *e == Event::Teardown));
}
