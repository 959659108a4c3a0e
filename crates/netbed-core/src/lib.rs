//! Scenario coordination protocol for the netbed distributed testbed
//!
//! This crate implements the control plane that drives one experiment run
//! across many participant nodes: a driver process connects to every node,
//! distributes a synchronized start instant, broadcasts topology snapshots,
//! and injects scripted node failures against a simulation clock. The
//! remote-side counterpart (`PeerListener`) accepts the driver's connection
//! and answers its commands.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod clock;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod errors;
pub mod identity;
pub mod listener;
pub mod protocol;
pub mod retry;
pub mod scenario;
pub mod topology;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use clock::{AbsoluteClock, SimulationClock, VirtualClock};
pub use config::{AgentConfig, DriverConfig, COORDINATION_PORT, TRAFFIC_GENERATOR_PORT};
pub use connection::PeerConnection;
pub use coordinator::ScenarioCoordinator;
pub use errors::CoordinationError;
pub use identity::NodeName;
pub use listener::{AgentHandler, PeerListener, StartGate};
pub use protocol::{ControlRequest, ControlResponse, ResponseStatus};
pub use scenario::{ControlNames, NodeFailure, Scenario};
pub use topology::{Link, TopologyGraph, TopologyUpdate};

pub type Result<T> = std::result::Result<T, CoordinationError>;
