//! Coordination configuration
//!
//! The reference deployment uses uniform constants (ports, retry budgets,
//! warmup windows). They are configuration here, loadable from a TOML file
//! with these defaults, but the bounded-attempts-then-hard-failure
//! semantics they parameterize are fixed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CoordinationError;
use crate::retry::RetryPolicy;
use crate::Result;

/// Well-known port compute nodes and clients listen on for the coordinator.
pub const COORDINATION_PORT: u16 = 64000;

/// Well-known port background-traffic generators listen on, offset so a
/// generator can share a host with a compute node or client.
pub const TRAFFIC_GENERATOR_PORT: u16 = COORDINATION_PORT + 1;

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

/// Configuration for the coordinator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Port compute nodes and clients are dialed on.
    pub coordination_port: u16,
    /// Port background-traffic generators are dialed on.
    pub traffic_generator_port: u16,

    /// Initial connection budget per node.
    pub connect_attempts: u32,
    pub connect_retry_ms: u64,

    /// START acknowledgment budget per node.
    pub start_attempts: u32,
    pub start_retry_ms: u64,

    /// A command round trip exceeding this counts as a failed send.
    pub command_timeout_ms: u64,

    /// Delay from driver startup to the agent-algorithm start instant.
    pub algorithm_start_wait_ms: u64,
    /// Further delay from the algorithm start to the client start instant.
    pub client_start_wait_ms: u64,

    /// Worker budget for fire-and-forget shutdown commands.
    pub shutdown_pool_size: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            coordination_port: COORDINATION_PORT,
            traffic_generator_port: TRAFFIC_GENERATOR_PORT,
            connect_attempts: 50,
            connect_retry_ms: 30_000,
            start_attempts: 10,
            start_retry_ms: 1_000,
            command_timeout_ms: 30_000,
            algorithm_start_wait_ms: 10 * 60 * 1_000,
            client_start_wait_ms: 5 * 60 * 1_000,
            shutdown_pool_size: 4,
        }
    }
}

impl DriverConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts, Duration::from_millis(self.connect_retry_ms))
    }

    pub fn start_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.start_attempts, Duration::from_millis(self.start_retry_ms))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shutdown_pool_size == 0 {
            return Err(CoordinationError::Scenario(
                "shutdown_pool_size must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Agent
// ----------------------------------------------------------------------------

/// Configuration for a participant-node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Port the listener binds.
    pub port: u16,
    /// Delay between acknowledging SHUTDOWN and invoking the host shutdown
    /// callback, so the response reaches the coordinator first.
    pub shutdown_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            port: COORDINATION_PORT,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
