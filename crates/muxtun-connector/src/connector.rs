//! The abstract destination-connector contract

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Connector errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown connector type: {0}")]
    UnknownType(String),

    #[error("Bad connector parameters: {0}")]
    BadParams(String),

    #[error("Destination vetoed: {0}")]
    Rejected(String),

    #[error("Upstream tunnel error: {0}")]
    Upstream(String),
}

/// What a live connector reports back about its destination.
#[derive(Debug)]
pub enum ConnectorEvent {
    Data(Bytes),
    Closed,
    Failed(String),
}

/// A connected destination: a sender for outbound bytes and a stream of
/// inbound events. Dropping the sender asks the connector to shut down
/// gracefully; the event stream always ends with `Closed` or `Failed`.
pub struct ConnectorHandle {
    input: mpsc::Sender<Bytes>,
    events: mpsc::Receiver<ConnectorEvent>,
}

impl ConnectorHandle {
    pub fn new(input: mpsc::Sender<Bytes>, events: mpsc::Receiver<ConnectorEvent>) -> Self {
        Self { input, events }
    }

    /// Split into the outbound sender and the inbound event stream, so the
    /// two directions can be driven from different tasks.
    pub fn split(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<ConnectorEvent>) {
        (self.input, self.events)
    }
}

/// Default capacity for connector channels; bounded so a slow destination
/// backpressures the demux loop instead of buffering without limit.
pub(crate) const CHANNEL_CAPACITY: usize = 64;
