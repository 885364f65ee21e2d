//! Per-logical-connection handles

use crate::ClientError;
use bytes::Bytes;
use muxtun_proto::{write_client_close, write_data};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Everything a logical connection ever reports to its owner.
#[derive(Debug)]
pub enum StreamEvent {
    Connected,
    Data(Bytes),
    Closed,
    Failed(String),
}

pub(crate) type FlowMap = Arc<StdMutex<HashMap<u32, mpsc::UnboundedSender<StreamEvent>>>>;
pub(crate) type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// The outbound half of a logical connection. Cheap to clone; all clones
/// share the link's serialized output stream.
#[derive(Clone)]
pub struct TunnelSender {
    id: u32,
    writer: SharedWriter,
    flows: FlowMap,
}

impl TunnelSender {
    pub(crate) fn new(id: u32, writer: SharedWriter, flows: FlowMap) -> Self {
        Self { id, writer, flows }
    }

    /// The connectionId on the wire, unique within the owning link.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queue bytes onto the shared stream. Empty buffers are ignored.
    pub async fn send(&self, data: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        write_data(&mut *writer, self.id, data).await?;
        Ok(())
    }

    /// Fire-and-forget close: the local flow is removed immediately and a
    /// CLOSE frame is sent without waiting for any peer acknowledgment.
    pub async fn close(&self) {
        self.flows.lock().unwrap().remove(&self.id);
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_client_close(&mut *writer, self.id).await {
            debug!("CLOSE for connection {} not delivered: {}", self.id, e);
        }
    }
}

/// One multiplexed flow: a sender plus its ordered event stream.
pub struct TunnelStream {
    sender: TunnelSender,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl TunnelStream {
    pub(crate) fn new(sender: TunnelSender, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self { sender, events }
    }

    pub fn id(&self) -> u32 {
        self.sender.id()
    }

    /// Next event, in delivery order. `None` only after a terminal
    /// `Closed`/`Failed` event has been consumed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), ClientError> {
        self.sender.send(data).await
    }

    pub async fn close(&self) {
        self.sender.close().await
    }

    /// Split into the clonable sender and the event stream so the two
    /// directions can be driven from different tasks.
    pub fn split(self) -> (TunnelSender, mpsc::UnboundedReceiver<StreamEvent>) {
        (self.sender, self.events)
    }
}
