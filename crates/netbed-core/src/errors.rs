//! Error types for the coordination protocol
//!
//! Fatal errors (a node that never connects, a start phase that never
//! completes) surface here; transient I/O on an established connection is
//! absorbed into boolean send results and retry loops instead.

use crate::identity::NodeName;

/// Errors raised by scenario coordination
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// A peer never accepted a connection within its retry budget.
    /// Connection setup is all-or-nothing, so this aborts the run.
    #[error("Unable to connect to node {node}")]
    NodeUnreachable { node: NodeName },

    /// A peer never acknowledged START within its retry budget. The whole
    /// phase fails; no partial scenario is started.
    #[error("Start phase '{phase}' failed: some nodes never acknowledged start")]
    StartPhaseFailed { phase: &'static str },

    /// Bad scenario input (topology, failure list, control names).
    #[error("Invalid scenario input: {0}")]
    Scenario(String),

    /// Bad configuration file.
    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
