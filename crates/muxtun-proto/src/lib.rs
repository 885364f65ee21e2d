//! Tunnel Protocol Definitions
//!
//! This crate defines the wire frame codec and the logical-connection
//! state shared by the tunnel client and the tunnel relay.

pub mod address;
pub mod codec;
pub mod flow;

pub use address::Address;
pub use codec::{
    read_client_frame, read_relay_frame, write_client_close, write_data, write_fail, write_new,
    write_relay_close, ClientFrame, ProtoError, RelayFrame,
};
pub use flow::Phase;

/// Maximum payload or parameter block size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
