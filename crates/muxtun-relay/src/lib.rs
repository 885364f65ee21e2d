//! Tunnel relay
//!
//! Accepts physical links from tunnel clients, demultiplexes their
//! frames, opens destination connectors per logical connection, and
//! relays bytes both ways. The `reproxy` module chains one relay through
//! another by resolving destinations over a nested tunnel client.

pub mod relay;
pub mod reproxy;

pub use relay::{ConnectGate, RelayConfig, RelayError, TunnelRelay};
pub use reproxy::{reproxy_params, ReproxyClientConfigurator, ReproxyConfigurator};
