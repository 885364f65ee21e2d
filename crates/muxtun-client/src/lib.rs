//! Tunnel client
//!
//! Multiplexes many logical connections over one physical link to a
//! tunnel relay. The link is dialed lazily on the first `connect`, shared
//! by every logical connection after that, and rebuilt from scratch (ids
//! restarting at 0) after a physical failure.

pub mod client;
pub mod listener;
pub mod stream;

pub use client::{TunnelClient, TunnelClientBuilder};
pub use listener::LinkListener;
pub use stream::{StreamEvent, TunnelSender, TunnelStream};

use muxtun_connector::ConnectorError;
use muxtun_proto::ProtoError;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection ids exhausted on this link")]
    IdsExhausted,
}
