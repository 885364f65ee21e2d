//! Destination connectors and their type registry
//!
//! A connector is the relay-side leg of one logical connection: something
//! that can reach a destination, accept outbound byte buffers, and report
//! data/closed/failed back. The registry maps a short type tag to the
//! client-side parameter encoder and the relay-side decoder + factory for
//! one connector kind.

pub mod connector;
pub mod registry;
pub mod tcp;
pub mod udp;

pub use connector::{ConnectorError, ConnectorEvent, ConnectorHandle};
pub use registry::{
    tags, ClientConfigurator, ConnectorFactory, ConnectorRegistry, EmptyClientConfigurator,
    RegistryBuilder, ServerConfigurator,
};
pub use tcp::TcpConnectorFactory;
pub use udp::UdpConnectorFactory;
