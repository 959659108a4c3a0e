//! Peer listener
//!
//! Every participant node runs one of these: it accepts the coordinator's
//! connection, reads a stream of JSON requests, and answers each with exactly
//! one response before reading the next. Host-specific behavior (what a
//! start, topology change, or shutdown actually does on the node) lives
//! behind [`AgentHandler`]; the common case of parking a thread until the
//! start command arrives is covered by [`StartGate`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    ControlRequest, ControlResponse, JsonStream, REQUEST_SHUTDOWN, REQUEST_START,
    REQUEST_TOPOLOGY_UPDATE,
};
use crate::topology::TopologyUpdate;
use crate::Result;

// ----------------------------------------------------------------------------
// Host seam
// ----------------------------------------------------------------------------

/// Host-side reactions to coordinator commands.
///
/// `Ok(Some(text))` answers OK with an informational message (how client
/// nodes acknowledge commands they have no use for); `Err(text)` answers
/// ERROR and keeps the connection serving.
pub trait AgentHandler: Send + Sync + 'static {
    /// The coordinator announced the absolute start instant.
    fn handle_start(&self, start_time_ms: u64) -> std::result::Result<Option<String>, String>;

    /// A new full topology snapshot arrived.
    fn handle_topology_update(
        &self,
        update: TopologyUpdate,
    ) -> std::result::Result<Option<String>, String>;

    /// SHUTDOWN was received; the returned message goes into the OK
    /// acknowledgment sent before anything else happens.
    fn acknowledge_shutdown(&self) -> Option<String>;

    /// Invoked after the shutdown grace period, once the acknowledgment has
    /// been flushed. The host-specific teardown happens here.
    fn trigger_shutdown(&self);
}

// ----------------------------------------------------------------------------
// Start gate
// ----------------------------------------------------------------------------

/// Single-shot handoff of the start command from the connection-handling
/// task to the node's main task.
///
/// The gate arms exactly once. A second START is not an error, since the
/// coordinator's retry loop may resend after a lost response, but it never
/// re-arms the gate or changes the armed time.
#[derive(Clone)]
pub struct StartGate {
    tx: Arc<watch::Sender<Option<u64>>>,
}

impl StartGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        StartGate { tx: Arc::new(tx) }
    }

    /// Arm the gate with the absolute start time. Returns false (and leaves
    /// the gate untouched) if it was already armed.
    pub fn signal(&self, start_time_ms: u64) -> bool {
        let mut armed = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(start_time_ms);
                armed = true;
                true
            } else {
                false
            }
        });
        armed
    }

    pub fn start_time(&self) -> Option<u64> {
        *self.tx.borrow()
    }

    /// Park until the gate is armed; returns the absolute start time.
    pub async fn wait(&self) -> u64 {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(time) = *rx.borrow() {
                return time;
            }
            if rx.changed().await.is_err() {
                // sender kept alive by self; unreachable in practice
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------------

/// Accepts coordinator connections and serves the command protocol.
pub struct PeerListener {
    listener: TcpListener,
    handler: Arc<dyn AgentHandler>,
    shutdown_grace: Duration,
}

impl PeerListener {
    /// Bind the listening socket. Use port 0 to let the OS pick (tests).
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn AgentHandler>,
        shutdown_grace: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for the coordinator on {}", listener.local_addr()?);
        Ok(PeerListener {
            listener,
            handler,
            shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one handler task per connection.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (socket, remote) = self.listener.accept().await?;
            debug!("Got connection from {}", remote);
            let handler = Arc::clone(&self.handler);
            let grace = self.shutdown_grace;
            tokio::spawn(async move {
                handle_connection(socket, remote, handler, grace).await;
            });
        }
    }
}

/// Strict request/response loop for one coordinator connection. Exits
/// silently when the peer closes the socket; that is the expected path when
/// the coordinator disconnects.
async fn handle_connection(
    socket: TcpStream,
    remote: SocketAddr,
    handler: Arc<dyn AgentHandler>,
    shutdown_grace: Duration,
) {
    let mut stream = JsonStream::new(socket);
    loop {
        let request = match stream.recv::<ControlRequest>().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("Coordinator at {} closed the connection", remote);
                return;
            }
            Err(e) => {
                error!("Error reading request from {}: {}", remote, e);
                return;
            }
        };

        debug!("Got {} request from {}", request.kind, remote);
        let response = dispatch(&request, &handler, shutdown_grace);
        if let Err(e) = stream.send(&response).await {
            error!("Error sending response to {}: {}", remote, e);
            return;
        }
    }
}

fn dispatch(
    request: &ControlRequest,
    handler: &Arc<dyn AgentHandler>,
    shutdown_grace: Duration,
) -> ControlResponse {
    match request.kind.as_str() {
        REQUEST_START => match &request.payload {
            Some(payload) => match serde_json::from_value::<u64>(payload.clone()) {
                Ok(start_time_ms) => into_response(handler.handle_start(start_time_ms)),
                Err(e) => {
                    error!("Got error decoding start payload: {}", e);
                    ControlResponse::error(format!(
                        "Got error decoding start payload, skipping processing of message: {}",
                        e
                    ))
                }
            },
            None => {
                warn!("Skipping start with null payload");
                ControlResponse::error("Got null payload on start, ignoring")
            }
        },

        REQUEST_TOPOLOGY_UPDATE => match &request.payload {
            Some(payload) => match serde_json::from_value::<TopologyUpdate>(payload.clone()) {
                Ok(update) => into_response(handler.handle_topology_update(update)),
                Err(e) => {
                    error!("Got error decoding topology update payload: {}", e);
                    ControlResponse::error(format!(
                        "Got error decoding topology update payload, skipping processing of message: {}",
                        e
                    ))
                }
            },
            None => {
                warn!("Skipping topology update with null payload");
                ControlResponse::error("Got null payload on topology update, ignoring")
            }
        },

        REQUEST_SHUTDOWN => {
            let message = handler.acknowledge_shutdown();
            // acknowledge first; the host teardown runs after the grace
            // period so the response reaches the coordinator
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                tokio::time::sleep(shutdown_grace).await;
                handler.trigger_shutdown();
            });
            match message {
                Some(message) => ControlResponse::ok_with_message(message),
                None => ControlResponse::ok(),
            }
        }

        unknown => {
            warn!("Got unknown request: {}", unknown);
            ControlResponse::error(format!("Unknown request: {}", unknown))
        }
    }
}

fn into_response(result: std::result::Result<Option<String>, String>) -> ControlResponse {
    match result {
        Ok(Some(message)) => ControlResponse::ok_with_message(message),
        Ok(None) => ControlResponse::ok(),
        Err(message) => ControlResponse::error(message),
    }
}
