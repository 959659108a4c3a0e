//! Scenario inputs
//!
//! A scenario directory provides the graph of participant nodes
//! (`topology.json`), the scripted node failures (`node-failures.json`), and
//! optionally a map from node name to the control-plane hostname used to
//! actually dial it. The richer network-emulation description these are
//! derived from is out of scope; this is the graph-as-input form.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::errors::CoordinationError;
use crate::identity::NodeName;
use crate::topology::TopologyGraph;
use crate::Result;

pub const TOPOLOGY_FILENAME: &str = "topology.json";
pub const NODE_FAILURES_FILENAME: &str = "node-failures.json";

// ----------------------------------------------------------------------------
// Failure events
// ----------------------------------------------------------------------------

/// A scripted node failure: at simulated time `time` (milliseconds on the
/// simulation clock), one of `nodes` is shut down. Choosing among multiple
/// candidates by an algorithm is unsupported; the first listed candidate is
/// always taken.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeFailure {
    pub time: u64,
    pub nodes: Vec<NodeName>,
}

// ----------------------------------------------------------------------------
// Topology description
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NodeSpec {
    name: NodeName,
    /// Client nodes run request generators; everything else is a compute
    /// node running the agent algorithms.
    #[serde(default)]
    client: bool,
}

#[derive(Debug, Deserialize)]
struct LinkSpec {
    left: NodeName,
    right: NodeName,
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    nodes: Vec<NodeSpec>,
    #[serde(default)]
    links: Vec<LinkSpec>,
}

/// A fully loaded scenario: the topology graph, the node role partition,
/// and the ordered failure timeline.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub graph: TopologyGraph,
    pub compute_nodes: Vec<NodeName>,
    pub clients: Vec<NodeName>,
    pub failures: Vec<NodeFailure>,
}

impl Scenario {
    /// Build a scenario programmatically (used by tests and embedders that
    /// already hold a parsed topology).
    pub fn new(
        graph: TopologyGraph,
        compute_nodes: Vec<NodeName>,
        clients: Vec<NodeName>,
        mut failures: Vec<NodeFailure>,
    ) -> Self {
        failures.sort_by_key(|f| f.time);
        Scenario {
            graph,
            compute_nodes,
            clients,
            failures,
        }
    }

    /// Load a scenario from a directory. `topology.json` is required;
    /// `node-failures.json` is optional (no scripted failures).
    pub fn load(dir: &Path) -> Result<Self> {
        let topology_path = dir.join(TOPOLOGY_FILENAME);
        let raw = std::fs::read_to_string(&topology_path).map_err(|e| {
            CoordinationError::Scenario(format!("cannot read {}: {}", topology_path.display(), e))
        })?;
        let file: TopologyFile = serde_json::from_str(&raw)?;

        let mut graph = TopologyGraph::new();
        let mut compute_nodes = Vec::new();
        let mut clients = Vec::new();
        for node in &file.nodes {
            graph.add_node(node.name.clone());
            if node.client {
                clients.push(node.name.clone());
            } else {
                compute_nodes.push(node.name.clone());
            }
        }
        for link in &file.links {
            if !graph.contains(&link.left) || !graph.contains(&link.right) {
                return Err(CoordinationError::Scenario(format!(
                    "link {} <-> {} references a node missing from the node list",
                    link.left, link.right
                )));
            }
            graph.add_link(link.left.clone(), link.right.clone());
        }

        let failures_path = dir.join(NODE_FAILURES_FILENAME);
        let failures = if failures_path.exists() {
            let raw = std::fs::read_to_string(&failures_path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };

        Ok(Scenario::new(graph, compute_nodes, clients, failures))
    }

    /// Every participant node; background-traffic generators run on all of
    /// them regardless of role.
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeName> {
        self.compute_nodes.iter().chain(self.clients.iter())
    }
}

// ----------------------------------------------------------------------------
// Control-plane addressing
// ----------------------------------------------------------------------------

/// Map from node name to the hostname (optionally `host:port`) on the
/// control network. The topology identifier of a node often differs from
/// the name it is reachable under; nodes absent from the map are dialed by
/// their bare name across the experiment network.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ControlNames(HashMap<NodeName, String>);

impl ControlNames {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn insert(&mut self, node: NodeName, address: impl Into<String>) {
        self.0.insert(node, address.into());
    }

    /// Resolve the address to dial for `node` at the role's well-known
    /// `port`. A `host:port` map entry overrides the port; a value with more
    /// than one colon (a bare IPv6 address) is taken as a host verbatim.
    pub fn resolve(&self, node: &NodeName, port: u16) -> (String, u16) {
        match self.0.get(node) {
            Some(value) => match value.rsplit_once(':') {
                Some((host, p)) if !host.contains(':') => match p.parse::<u16>() {
                    Ok(explicit) => (host.to_owned(), explicit),
                    Err(_) => (value.clone(), port),
                },
                _ => (value.clone(), port),
            },
            None => {
                warn!(
                    "Unable to find {} in control node names, connection will be across the experiment network",
                    node
                );
                (node.as_str().to_owned(), port)
            }
        }
    }
}
