//! Relay server implementation

use muxtun_connector::{ConnectorError, ConnectorEvent, ConnectorRegistry};
use muxtun_proto::{
    read_client_frame, write_data, write_fail, write_relay_close, Address, ClientFrame, Phase,
    ProtoError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
        }
    }
}

/// Per-link veto hook: may reject a destination/type before the relay
/// opens anything, failing that logical connection immediately.
pub trait ConnectGate: Send + Sync {
    fn allow(&self, dest: &Address, tag: &str) -> bool;
}

/// Multiplexing tunnel relay.
pub struct TunnelRelay {
    config: RelayConfig,
    registry: Arc<ConnectorRegistry>,
    gate: Option<Arc<dyn ConnectGate>>,
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Relay-side state of one logical connection. The map is shared between
/// the demux loop and the per-flow pumps: the demux inserts and handles
/// client CLOSE, each pump retires its own entry when the destination
/// connector ends.
type FlowMap = Arc<StdMutex<HashMap<u32, Flow>>>;

struct Flow {
    phase: Phase,
    input: mpsc::Sender<bytes::Bytes>,
}

impl TunnelRelay {
    pub fn new(config: RelayConfig, registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            config,
            registry,
            gate: None,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ConnectGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| RelayError::BindError {
                address: self.config.bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener. Each accepted link gets one
    /// independent demultiplexing task and its own connectionId namespace.
    pub async fn run_on(self, listener: TcpListener) -> Result<(), RelayError> {
        let local_addr = listener.local_addr()?;
        info!("Tunnel relay listening on {}", local_addr);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted tunnel link from {}", peer_addr);
                    let registry = self.registry.clone();
                    let gate = self.gate.clone();
                    tokio::spawn(async move {
                        handle_link(socket, peer_addr, registry, gate).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept tunnel link: {}", e);
                }
            }
        }
    }
}

/// Drive one physical link until it dies, then close every destination
/// connector still open on it.
async fn handle_link(
    socket: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ConnectorRegistry>,
    gate: Option<Arc<dyn ConnectGate>>,
) {
    let (read_half, write_half) = socket.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));
    let mut reader = BufReader::new(read_half);
    let flows: FlowMap = Arc::new(StdMutex::new(HashMap::new()));

    if let Err(e) = demux(&mut reader, &writer, &flows, &registry, &gate).await {
        info!("Tunnel link from {} ended: {}", peer_addr, e);
    }

    // Fan-out on link teardown: dropping each input sender shuts its
    // destination connector down.
    let mut flows = flows.lock().unwrap();
    debug!(
        "Closing {} destination connector(s) for link from {}",
        flows.len(),
        peer_addr
    );
    flows.clear();
}

/// The link's single demultiplexing loop.
///
/// Deliberately blocks on each destination connect before reading the
/// next frame: setup latency on one link is serialized so that frames for
/// a not-yet-open connection never need buffering or reordering.
async fn demux(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &SharedWriter,
    flows: &FlowMap,
    registry: &Arc<ConnectorRegistry>,
    gate: &Option<Arc<dyn ConnectGate>>,
) -> Result<(), RelayError> {
    loop {
        match read_client_frame(reader).await? {
            ClientFrame::New {
                id,
                dest,
                tag,
                params,
            } => {
                if flows.lock().unwrap().contains_key(&id) {
                    warn!("Connection id {} already live on this link", id);
                    fail(writer, id).await;
                    continue;
                }
                if let Some(gate) = gate {
                    if !gate.allow(&dest, &tag) {
                        warn!("Vetoed {} connect to {}", tag, dest);
                        fail(writer, id).await;
                        continue;
                    }
                }

                let factory = match registry.resolve(&tag, params) {
                    Ok(f) => f,
                    Err(ConnectorError::UnknownType(t)) => {
                        // Parameters were consumed via their length prefix,
                        // so only this logical connection is lost.
                        warn!("Unknown connector type: {}", t);
                        fail(writer, id).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Connector type {} rejected parameters: {}", tag, e);
                        fail(writer, id).await;
                        continue;
                    }
                };

                let phase = Phase::Opening;
                debug!("Connection {} opening {} to {}", id, tag, dest);
                match factory.connect(&dest).await {
                    Ok(handle) => {
                        let phase = phase.transition(Phase::Open)?;
                        let (input, events) = handle.split();
                        flows.lock().unwrap().insert(id, Flow { phase, input });
                        tokio::spawn(pump(id, events, writer.clone(), flows.clone()));
                    }
                    Err(e) => {
                        warn!("Connection {} to {} failed: {}", id, dest, e);
                        fail(writer, id).await;
                    }
                }
            }
            ClientFrame::Data { id, payload } => {
                // The sender is cloned out so the lock never spans the send.
                let input = {
                    let flows = flows.lock().unwrap();
                    match flows.get(&id) {
                        Some(flow) if flow.phase == Phase::Open => Some(flow.input.clone()),
                        _ => None,
                    }
                };
                match input {
                    // A send error means the connector already ended; its
                    // pump has reported CLOSE/FAIL, so the payload is stale.
                    Some(input) => {
                        let _ = input.send(payload).await;
                    }
                    None => debug!("Dropping DATA for unknown connection {}", id),
                }
            }
            ClientFrame::Close { id } => {
                let removed = flows.lock().unwrap().remove(&id);
                if let Some(mut flow) = removed {
                    debug!("Connection {} closed by client", id);
                    flow.phase = flow.phase.transition(Phase::Closed)?;
                }
            }
        }
    }
}

/// Relay one destination connector's events back to the client as
/// DATA/CLOSE/FAIL frames until the connector ends, then retire the flow.
async fn pump(id: u32, mut events: mpsc::Receiver<ConnectorEvent>, writer: SharedWriter, flows: FlowMap) {
    while let Some(event) = events.recv().await {
        let mut w = writer.lock().await;
        let (result, done) = match event {
            ConnectorEvent::Data(data) => (write_data(&mut *w, id, &data).await, false),
            ConnectorEvent::Closed => (write_relay_close(&mut *w, id).await, true),
            ConnectorEvent::Failed(reason) => {
                warn!("Connection {} destination failed: {}", id, reason);
                (write_fail(&mut *w, id).await, true)
            }
        };
        if done || result.is_err() {
            break;
        }
    }
    // The client never sends CLOSE for a flow the relay terminated, so the
    // pump removes its own entry; dropping the input sender lets the
    // connector's outbound side shut down.
    flows.lock().unwrap().remove(&id);
}

async fn fail(writer: &SharedWriter, id: u32) {
    let mut w = writer.lock().await;
    if let Err(e) = write_fail(&mut *w, id).await {
        debug!("FAIL for connection {} not delivered: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:0");
    }
}
