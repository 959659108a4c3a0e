//! Peer connection
//!
//! One long-lived TCP connection from the coordinator to one participant
//! node. Connecting retries on a fixed budget; a connection that exhausts the
//! budget still yields a value, with `is_connected()` false, so the caller
//! decides how fatal that is. Established-connection sends are synchronous
//! round trips that convert any I/O failure into a boolean result; retry
//! policy belongs to the caller.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::identity::NodeName;
use crate::protocol::{ControlRequest, ControlResponse, JsonStream};
use crate::retry::{retry_fixed, RetryPolicy};
use crate::topology::TopologyUpdate;

/// Command/response channel to exactly one remote node.
///
/// Round trips hold the channel lock for their duration: no pipelining on a
/// single connection. Concurrency comes from the caller issuing commands to
/// different connections on different tasks. An I/O failure or timeout tears
/// the channel down, and the next send dials the node once more before
/// giving up, so a caller's retry budget can ride out a transient fault.
/// An explicit [`PeerConnection::disconnect`] is terminal: every further
/// send fails fast.
pub struct PeerConnection {
    node: NodeName,
    host: String,
    port: u16,
    command_timeout: Duration,
    closed: AtomicBool,
    channel: Mutex<Option<JsonStream<TcpStream>>>,
}

impl PeerConnection {
    /// Dial `host:port`, retrying on the given budget. Always returns a
    /// connection object; check [`PeerConnection::is_connected`] to see
    /// whether the budget was exhausted.
    pub async fn connect(
        node: NodeName,
        host: &str,
        port: u16,
        policy: RetryPolicy,
        command_timeout: Duration,
    ) -> Self {
        info!("Connecting to {} at {}:{}", node, host, port);

        let stream = retry_fixed(policy, |attempt| async move {
            debug!(
                "Connection attempt {} of {} to {}:{}",
                attempt, policy.attempts, host, port
            );
            TcpStream::connect((host, port)).await
        })
        .await;

        let channel = match stream {
            Ok(stream) => {
                debug!("Connected to {}:{}", host, port);
                Some(JsonStream::new(stream))
            }
            Err(e) => {
                warn!(
                    "Exhausted {} connection attempts to {} at {}:{}: {}",
                    policy.attempts, node, host, port, e
                );
                None
            }
        };

        PeerConnection {
            node,
            host: host.to_owned(),
            port,
            command_timeout,
            closed: AtomicBool::new(false),
            channel: Mutex::new(channel),
        }
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Send START with the absolute start time (epoch milliseconds).
    /// True iff the peer answered OK.
    pub async fn send_start(&self, start_time_ms: u64) -> bool {
        self.send_command(ControlRequest::start(start_time_ms)).await
    }

    /// Send SHUTDOWN. True iff the peer answered OK.
    pub async fn send_shutdown(&self) -> bool {
        debug!("Sending shutdown to {}", self.node);
        self.send_command(ControlRequest::shutdown()).await
    }

    /// Send a full topology snapshot. True iff the peer answered OK.
    pub async fn send_topology_update(&self, update: &TopologyUpdate) -> bool {
        match ControlRequest::topology_update(update) {
            Ok(request) => self.send_command(request).await,
            Err(e) => {
                warn!("Unable to serialize topology update for {}: {}", self.node, e);
                false
            }
        }
    }

    /// Close the connection. Idempotent; after this every send fails fast.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.channel.lock().await;
        if guard.take().is_some() {
            debug!("Disconnected from {}:{}", self.node, self.port);
        } else {
            debug!("Already disconnected from {}:{}", self.node, self.port);
        }
    }

    /// One strict request/response round trip. Any I/O failure or timeout
    /// tears the channel down and reports false; the following send dials
    /// the node again.
    async fn send_command(&self, request: ControlRequest) -> bool {
        let kind = request.kind.clone();
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            if self.closed.load(Ordering::SeqCst) {
                debug!("Disconnected from {}, failing {} immediately", self.node, kind);
                return false;
            }
            // one fresh dial per send keeps the caller's retry budget
            // meaningful across transient faults
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => {
                    info!("Reconnected to {} at {}:{}", self.node, self.host, self.port);
                    *guard = Some(JsonStream::new(stream));
                }
                Err(e) => {
                    warn!(
                        "Unable to reconnect to {} at {}:{}: {}",
                        self.node, self.host, self.port, e
                    );
                    return false;
                }
            }
        }
        let Some(channel) = guard.as_mut() else {
            return false;
        };

        let round_trip = async {
            channel.send(&request).await?;
            match channel.recv::<ControlResponse>().await? {
                Some(response) => Ok::<ControlResponse, io::Error>(response),
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response",
                )),
            }
        };

        let outcome = tokio::time::timeout(self.command_timeout, round_trip).await;
        match outcome {
            Ok(Ok(response)) => {
                debug!(
                    "Response to {} from {}: {:?} {:?}",
                    kind, self.node, response.status, response.message
                );
                response.is_ok()
            }
            Ok(Err(e)) => {
                warn!("I/O error sending {} to {}: {}", kind, self.node, e);
                *guard = None;
                false
            }
            Err(_) => {
                warn!(
                    "Timed out after {:?} waiting for {} response from {}",
                    self.command_timeout, kind, self.node
                );
                *guard = None;
                false
            }
        }
    }
}
