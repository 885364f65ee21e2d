//! Tunnel client state machine

use crate::listener::LinkListener;
use crate::stream::{FlowMap, SharedWriter, StreamEvent, TunnelSender, TunnelStream};
use crate::ClientError;
use bytes::Bytes;
use muxtun_connector::ConnectorRegistry;
use muxtun_proto::{read_relay_frame, write_new, Address, RelayFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::BufReader;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One live physical link and the flows multiplexed over it.
struct Link {
    writer: SharedWriter,
    flows: FlowMap,
    next_id: u32,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Multiplexing tunnel client. One instance owns at most one physical
/// link to its relay; `connect` dials it lazily and reuses it until it
/// fails.
pub struct TunnelClient {
    relay_addr: String,
    registry: Arc<ConnectorRegistry>,
    listener: Option<Arc<dyn LinkListener>>,
    link: Mutex<Option<Link>>,
}

impl TunnelClient {
    pub fn builder() -> TunnelClientBuilder {
        TunnelClientBuilder::default()
    }

    /// Open a logical connection to `dest`, with parameters encoded by the
    /// registry entry for `tag`. An unknown tag fails synchronously before
    /// anything touches the wire.
    pub async fn connect(&self, dest: Address, tag: &str) -> Result<TunnelStream, ClientError> {
        let params = self.registry.encode_params(tag)?;
        self.connect_with_params(dest, tag, params).await
    }

    /// Open a logical connection forwarding an already-encoded parameter
    /// block verbatim. This is what lets a reproxy hop relay parameters it
    /// never parses.
    pub async fn connect_with_params(
        &self,
        dest: Address,
        tag: &str,
        params: Bytes,
    ) -> Result<TunnelStream, ClientError> {
        let mut guard = self.link.lock().await;

        if guard.as_ref().map_or(true, Link::is_closed) {
            *guard = Some(self.dial().await?);
        }

        let (id, writer, flows, closed) = {
            let link = guard.as_mut().unwrap();
            let id = link.next_id;
            link.next_id = id.checked_add(1).ok_or(ClientError::IdsExhausted)?;
            (
                id,
                link.writer.clone(),
                link.flows.clone(),
                link.closed.clone(),
            )
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The flow is OPEN the moment the NEW frame is queued; the relay
        // never acknowledges it.
        let _ = tx.send(StreamEvent::Connected);
        flows.lock().unwrap().insert(id, tx);
        debug!("Opening logical connection {} to {} ({})", id, dest, tag);

        {
            let mut w = writer.lock().await;
            if let Err(e) = write_new(&mut *w, id, &dest, tag, &params).await {
                drop(w);
                warn!("Link write failed while opening connection {}: {}", id, e);
                if let Some(link) = guard.take() {
                    link.reader.abort();
                    teardown(&link, &format!("tunnel link lost: {}", e));
                }
                if let Some(l) = &self.listener {
                    l.disconnected();
                }
                return Err(e.into());
            }
        }

        // The reader tears the link down without taking the link mutex, so
        // it may have drained the flow map between the is_closed check and
        // the insert above. A flow inserted after that drain would never
        // receive a terminal event; catch it here and fail synchronously.
        if closed.load(Ordering::SeqCst) {
            flows.lock().unwrap().remove(&id);
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel link lost",
            )));
        }

        let sender = TunnelSender::new(id, writer, flows);
        Ok(TunnelStream::new(sender, rx))
    }

    /// Tear the physical link down. Every live logical connection is
    /// closed synchronously; the next `connect` dials a fresh link with
    /// connectionIds restarting at 0.
    pub async fn shutdown(&self) {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.take() {
            info!("Shutting down tunnel link to {}", self.relay_addr);
            link.reader.abort();
            link.closed.store(true, Ordering::SeqCst);
            let drained: Vec<_> = {
                let mut flows = link.flows.lock().unwrap();
                flows.drain().collect()
            };
            for (_, tx) in drained {
                let _ = tx.send(StreamEvent::Closed);
            }
            let _ = link.writer.lock().await.shutdown().await;
            if let Some(l) = &self.listener {
                l.disconnected();
            }
        }
    }

    async fn dial(&self) -> Result<Link, ClientError> {
        let stream = match TcpStream::connect(&self.relay_addr).await {
            Ok(s) => s,
            Err(e) => {
                // Dial failure retains no link; the embedder may retry.
                if let Some(l) = &self.listener {
                    l.failed(&e);
                }
                return Err(e.into());
            }
        };
        info!("Tunnel link established to {}", self.relay_addr);
        if let Some(l) = &self.listener {
            l.connected();
        }

        let (read_half, write_half) = stream.into_split();
        let flows: FlowMap = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(run_reader(
            BufReader::new(read_half),
            flows.clone(),
            closed.clone(),
            self.listener.clone(),
        ));

        Ok(Link {
            writer: Arc::new(Mutex::new(write_half)),
            flows,
            next_id: 0,
            closed,
            reader,
        })
    }
}

/// Fan out a terminal event to every live flow and mark the link dead.
fn teardown(link: &Link, reason: &str) {
    link.closed.store(true, Ordering::SeqCst);
    let drained: Vec<_> = {
        let mut flows = link.flows.lock().unwrap();
        flows.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(StreamEvent::Failed(reason.to_string()));
    }
}

/// The link's single inbound reader: dispatches frames by connectionId
/// until the link dies, then fails every remaining flow exactly once.
async fn run_reader(
    mut reader: BufReader<OwnedReadHalf>,
    flows: FlowMap,
    closed: Arc<AtomicBool>,
    listener: Option<Arc<dyn LinkListener>>,
) {
    let err = loop {
        match read_relay_frame(&mut reader).await {
            Ok(RelayFrame::Data { id, payload }) => {
                let tx = flows.lock().unwrap().get(&id).cloned();
                match tx {
                    Some(tx) => {
                        let _ = tx.send(StreamEvent::Data(payload));
                    }
                    // Close/data races are expected; stale frames are dropped.
                    None => debug!("Dropping DATA for unknown connection {}", id),
                }
            }
            Ok(RelayFrame::Close { id }) => {
                if let Some(tx) = flows.lock().unwrap().remove(&id) {
                    let _ = tx.send(StreamEvent::Closed);
                }
            }
            Ok(RelayFrame::Fail { id }) => {
                if let Some(tx) = flows.lock().unwrap().remove(&id) {
                    let _ = tx.send(StreamEvent::Failed("relay reported failure".to_string()));
                }
            }
            Err(e) => break e,
        }
    };

    debug!("Tunnel link lost: {}", err);
    closed.store(true, Ordering::SeqCst);
    let drained: Vec<_> = {
        let mut map = flows.lock().unwrap();
        map.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(StreamEvent::Failed(format!("tunnel link lost: {}", err)));
    }
    if let Some(l) = listener {
        l.disconnected();
    }
}

/// Builder for [`TunnelClient`]
#[derive(Default)]
pub struct TunnelClientBuilder {
    relay_addr: Option<String>,
    registry: Option<Arc<ConnectorRegistry>>,
    listener: Option<Arc<dyn LinkListener>>,
}

impl TunnelClientBuilder {
    /// Relay address, as anything `TcpStream::connect` accepts.
    pub fn relay(mut self, addr: impl Into<String>) -> Self {
        self.relay_addr = Some(addr.into());
        self
    }

    pub fn registry(mut self, registry: Arc<ConnectorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn LinkListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<TunnelClient, ClientError> {
        let relay_addr = self
            .relay_addr
            .ok_or_else(|| ClientError::Config("relay address is required".to_string()))?;
        Ok(TunnelClient {
            relay_addr,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(ConnectorRegistry::builder().build())),
            listener: self.listener,
            link: Mutex::new(None),
        })
    }
}
