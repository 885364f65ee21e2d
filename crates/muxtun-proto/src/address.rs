//! Destination addresses carried inside NEW frames

use serde::{Deserialize, Serialize};
use std::fmt;

/// A host/port destination as seen by the multiplexer.
///
/// The host travels as an opaque UTF-8 string; name resolution happens
/// inside the destination connector, never in the protocol core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Address::new("example.com", 8080).to_string(), "example.com:8080");
    }

    #[test]
    fn test_from_socket_addr() {
        let addr: Address = "127.0.0.1:9000".parse::<std::net::SocketAddr>().unwrap().into();
        assert_eq!(addr, Address::new("127.0.0.1", 9000));
    }
}
