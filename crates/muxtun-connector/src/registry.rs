//! Connector-type registry
//!
//! An explicit configuration object handed to both the tunnel client and
//! the tunnel relay; there is no process-global type map. The builder
//! starts pre-populated with the built-in `tcp` and `udp` entries and the
//! last registration for a tag wins.

use crate::connector::{ConnectorError, ConnectorHandle};
use crate::tcp::TcpConnectorFactory;
use crate::udp::UdpConnectorFactory;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use muxtun_proto::Address;
use std::collections::HashMap;
use std::sync::Arc;

/// Built-in type tags.
pub mod tags {
    pub const TCP: &str = "tcp";
    pub const UDP: &str = "udp";
    pub const REPROXY: &str = "reproxy";
}

/// Client side of a registry entry: encodes the type-specific parameters
/// appended to a NEW frame. Runs once per logical connection.
pub trait ClientConfigurator: Send + Sync {
    fn encode(&self, tag: &str, out: &mut BytesMut) -> Result<(), ConnectorError>;
}

/// Relay side of a registry entry: decodes the parameter block of a NEW
/// frame into a connector factory for that logical connection.
pub trait ServerConfigurator: Send + Sync {
    fn configure(&self, tag: &str, params: Bytes) -> Result<Arc<dyn ConnectorFactory>, ConnectorError>;
}

/// Builds connectors toward destinations.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(&self, dest: &Address) -> Result<ConnectorHandle, ConnectorError>;
}

/// Parameter encoder for types that travel without parameters.
pub struct EmptyClientConfigurator;

impl ClientConfigurator for EmptyClientConfigurator {
    fn encode(&self, _tag: &str, _out: &mut BytesMut) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Relay-side entry wrapping one fixed factory, ignoring parameters.
struct FixedServerConfigurator {
    factory: Arc<dyn ConnectorFactory>,
}

impl ServerConfigurator for FixedServerConfigurator {
    fn configure(&self, _tag: &str, _params: Bytes) -> Result<Arc<dyn ConnectorFactory>, ConnectorError> {
        Ok(self.factory.clone())
    }
}

/// The connector-type registry shared by one peer.
pub struct ConnectorRegistry {
    client: HashMap<String, Arc<dyn ClientConfigurator>>,
    server: HashMap<String, Arc<dyn ServerConfigurator>>,
}

impl ConnectorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Encode the NEW-frame parameters for `tag`. An unknown tag is a
    /// synchronous error; nothing has touched the wire yet.
    pub fn encode_params(&self, tag: &str) -> Result<Bytes, ConnectorError> {
        let configurator = self
            .client
            .get(tag)
            .ok_or_else(|| ConnectorError::UnknownType(tag.to_string()))?;
        let mut out = BytesMut::new();
        configurator.encode(tag, &mut out)?;
        Ok(out.freeze())
    }

    /// Resolve the connector factory for `tag` from its parameter block.
    /// The parameters were length-prefixed on the wire, so an unknown tag
    /// here costs only its own logical connection, never the link.
    pub fn resolve(&self, tag: &str, params: Bytes) -> Result<Arc<dyn ConnectorFactory>, ConnectorError> {
        let configurator = self
            .server
            .get(tag)
            .ok_or_else(|| ConnectorError::UnknownType(tag.to_string()))?;
        configurator.configure(tag, params)
    }
}

/// Builder for [`ConnectorRegistry`], pre-populated with the built-ins.
pub struct RegistryBuilder {
    client: HashMap<String, Arc<dyn ClientConfigurator>>,
    server: HashMap<String, Arc<dyn ServerConfigurator>>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        let mut builder = Self {
            client: HashMap::new(),
            server: HashMap::new(),
        };
        builder = builder
            .register_client(tags::TCP, Arc::new(EmptyClientConfigurator))
            .register_client(tags::UDP, Arc::new(EmptyClientConfigurator))
            .register_factory(tags::TCP, Arc::new(TcpConnectorFactory))
            .register_factory(tags::UDP, Arc::new(UdpConnectorFactory));
        builder
    }
}

impl RegistryBuilder {
    pub fn register_client(mut self, tag: &str, configurator: Arc<dyn ClientConfigurator>) -> Self {
        self.client.insert(tag.to_string(), configurator);
        self
    }

    pub fn register_server(mut self, tag: &str, configurator: Arc<dyn ServerConfigurator>) -> Self {
        self.server.insert(tag.to_string(), configurator);
        self
    }

    /// Register a relay-side entry that ignores parameters and always uses
    /// the given factory.
    pub fn register_factory(self, tag: &str, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.register_server(tag, Arc::new(FixedServerConfigurator { factory }))
    }

    pub fn build(self) -> ConnectorRegistry {
        ConnectorRegistry {
            client: self.client,
            server: self.server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorEvent;
    use tokio::sync::mpsc;

    struct MarkerConfigurator(&'static [u8]);

    impl ClientConfigurator for MarkerConfigurator {
        fn encode(&self, _tag: &str, out: &mut BytesMut) -> Result<(), ConnectorError> {
            out.extend_from_slice(self.0);
            Ok(())
        }
    }

    struct NullFactory;

    #[async_trait]
    impl ConnectorFactory for NullFactory {
        async fn connect(&self, _dest: &Address) -> Result<ConnectorHandle, ConnectorError> {
            let (input, _drop) = mpsc::channel(1);
            let (_tx, events) = mpsc::channel::<ConnectorEvent>(1);
            Ok(ConnectorHandle::new(input, events))
        }
    }

    #[test]
    fn test_builtins_present() {
        let registry = ConnectorRegistry::builder().build();
        assert!(registry.encode_params(tags::TCP).unwrap().is_empty());
        assert!(registry.encode_params(tags::UDP).unwrap().is_empty());
        assert!(registry.resolve(tags::TCP, Bytes::new()).is_ok());
        assert!(registry.resolve(tags::UDP, Bytes::new()).is_ok());
    }

    #[test]
    fn test_unknown_tag_is_an_error_on_both_sides() {
        let registry = ConnectorRegistry::builder().build();
        assert!(matches!(
            registry.encode_params("bogus"),
            Err(ConnectorError::UnknownType(_))
        ));
        assert!(matches!(
            registry.resolve("bogus", Bytes::new()),
            Err(ConnectorError::UnknownType(_))
        ));
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = ConnectorRegistry::builder()
            .register_client(tags::TCP, Arc::new(MarkerConfigurator(b"first")))
            .register_client(tags::TCP, Arc::new(MarkerConfigurator(b"second")))
            .build();
        assert_eq!(&registry.encode_params(tags::TCP).unwrap()[..], b"second");
    }

    #[test]
    fn test_custom_factory_registration() {
        let registry = ConnectorRegistry::builder()
            .register_client("custom", Arc::new(EmptyClientConfigurator))
            .register_factory("custom", Arc::new(NullFactory))
            .build();
        assert!(registry.resolve("custom", Bytes::new()).is_ok());
    }
}
