//! Experiment topology
//!
//! The coordinator keeps the graph of participant nodes and the links between
//! them. The graph is mutated only when a scripted failure removes a node;
//! every broadcast serializes a full, self-consistent snapshot rather than
//! a delta, so a receiver can never observe a dangling link endpoint.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::identity::NodeName;

// ----------------------------------------------------------------------------
// Wire snapshot
// ----------------------------------------------------------------------------

/// An undirected link between two nodes in an update message.
///
/// Links are unordered pairs: `Link::new("a", "b")` equals
/// `Link::new("b", "a")`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub left: String,
    pub right: String,
}

impl Link {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Link {
            left: left.into(),
            right: right.into(),
        }
    }

    /// The pair with endpoints in canonical order, for unordered comparison.
    fn normalized(&self) -> (NodeName, NodeName) {
        let a = NodeName::new(&self.left);
        let b = NodeName::new(&self.right);
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Link {}

/// Full topology snapshot sent to compute-node peers whenever the topology
/// changes. Value type; produced fresh for every broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    /// Names of all nodes currently in the topology.
    pub nodes: Vec<String>,
    /// Pairs of nodes that are directly linked.
    pub links: Vec<Link>,
}

// ----------------------------------------------------------------------------
// Graph
// ----------------------------------------------------------------------------

/// Owned adjacency representation of the experiment topology.
///
/// Invariant: every link endpoint is present in the vertex set. The
/// coordinator guards the graph with a single lock; reads-for-broadcast and
/// failure-removal both run under it and never across a network call.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    vertices: BTreeSet<NodeName>,
    adjacency: BTreeMap<NodeName, BTreeSet<NodeName>>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with no links. Idempotent.
    pub fn add_node(&mut self, node: NodeName) {
        self.vertices.insert(node);
    }

    /// Add an undirected link, inserting both endpoints into the vertex set
    /// so the no-dangling-endpoint invariant holds by construction.
    pub fn add_link(&mut self, left: NodeName, right: NodeName) {
        self.vertices.insert(left.clone());
        self.vertices.insert(right.clone());
        self.adjacency
            .entry(left.clone())
            .or_default()
            .insert(right.clone());
        self.adjacency.entry(right).or_default().insert(left);
    }

    pub fn contains(&self, node: &NodeName) -> bool {
        self.vertices.contains(node)
    }

    pub fn node_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn link_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Remove a node and all of its incident links. Returns false if the
    /// node was not in the graph.
    pub fn remove_node(&mut self, node: &NodeName) -> bool {
        if !self.vertices.remove(node) {
            return false;
        }
        if let Some(neighbors) = self.adjacency.remove(node) {
            for neighbor in neighbors {
                if let Some(back) = self.adjacency.get_mut(&neighbor) {
                    back.remove(node);
                }
            }
        }
        true
    }

    /// Produce the full wire snapshot of the current graph.
    pub fn snapshot(&self) -> TopologyUpdate {
        let nodes = self.vertices.iter().map(|n| n.as_str().to_owned()).collect();
        let mut links = Vec::new();
        for (node, neighbors) in &self.adjacency {
            for neighbor in neighbors {
                // each undirected link appears once
                if node < neighbor {
                    links.push(Link::new(node.as_str(), neighbor.as_str()));
                }
            }
        }
        TopologyUpdate { nodes, links }
    }
}

impl From<&TopologyUpdate> for TopologyGraph {
    fn from(update: &TopologyUpdate) -> Self {
        let mut graph = TopologyGraph::new();
        for node in &update.nodes {
            graph.add_node(NodeName::new(node));
        }
        for link in &update.links {
            graph.add_link(NodeName::new(&link.left), NodeName::new(&link.right));
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle_minus_one() -> TopologyGraph {
        // A - B - C, no A-C link
        let mut graph = TopologyGraph::new();
        graph.add_link(NodeName::new("a"), NodeName::new("b"));
        graph.add_link(NodeName::new("b"), NodeName::new("c"));
        graph
    }

    #[test]
    fn snapshot_round_trips() {
        let graph = triangle_minus_one();
        let update = graph.snapshot();
        let rebuilt = TopologyGraph::from(&update);

        assert_eq!(rebuilt.node_count(), 3);
        assert_eq!(rebuilt.link_count(), 2);
        let reserialized = rebuilt.snapshot();
        assert_eq!(reserialized.nodes, update.nodes);
        // unordered link comparison
        for link in &update.links {
            assert!(reserialized.links.contains(link));
        }
    }

    #[test]
    fn links_compare_unordered() {
        assert_eq!(Link::new("a", "b"), Link::new("b", "a"));
        assert_eq!(Link::new("A", "b"), Link::new("b", "a"));
        assert_ne!(Link::new("a", "b"), Link::new("a", "c"));
    }

    #[test]
    fn removal_never_leaves_dangling_links() {
        let mut graph = triangle_minus_one();
        assert!(graph.remove_node(&NodeName::new("b")));

        let update = graph.snapshot();
        assert_eq!(update.nodes, vec!["a".to_owned(), "c".to_owned()]);
        assert!(update.links.is_empty());
        assert!(!update.nodes.contains(&"b".to_owned()));
    }

    #[test]
    fn removing_unknown_node_is_reported() {
        let mut graph = triangle_minus_one();
        assert!(!graph.remove_node(&NodeName::new("zz")));
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn add_link_inserts_endpoints() {
        let mut graph = TopologyGraph::new();
        graph.add_link(NodeName::new("x"), NodeName::new("y"));
        assert!(graph.contains(&NodeName::new("X")));
        assert!(graph.contains(&NodeName::new("Y")));
    }
}
