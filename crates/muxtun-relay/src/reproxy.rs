//! Reproxy: chaining one relay through another
//!
//! A registry entry whose relay-side factory never connects locally.
//! Its parameters name a second-hop relay, an inner connector type, and
//! that type's parameters as an opaque length-prefixed block; the factory
//! forwards the logical connection over a nested tunnel client bound to
//! the second hop. Nested clients are cached per hop address, so chained
//! flows stay multiplexed over one link, and chains nest to arbitrary
//! depth because the inner block is never parsed here.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use muxtun_client::{StreamEvent, TunnelClient};
use muxtun_connector::{
    ClientConfigurator, ConnectorError, ConnectorEvent, ConnectorFactory, ConnectorHandle,
    ServerConfigurator,
};
use muxtun_proto::codec::{get_block, get_string, get_u32, put_string};
use muxtun_proto::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

const CHANNEL_CAPACITY: usize = 64;

/// Encode reproxy parameters: second-hop address, inner type tag, and the
/// inner type's parameters as an opaque block.
pub fn reproxy_params(next_hop: &Address, inner_tag: &str, inner_params: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, &next_hop.host);
    buf.put_u32(u32::from(next_hop.port));
    put_string(&mut buf, inner_tag);
    buf.put_u32(inner_params.len() as u32);
    buf.put_slice(inner_params);
    buf.freeze()
}

fn decode_params(mut params: Bytes) -> Result<(Address, String, Bytes), ConnectorError> {
    let host = get_string(&mut params, "reproxy host")
        .map_err(|e| ConnectorError::BadParams(e.to_string()))?;
    let port = get_u32(&mut params, "reproxy port")
        .map_err(|e| ConnectorError::BadParams(e.to_string()))?;
    let port =
        u16::try_from(port).map_err(|_| ConnectorError::BadParams(format!("port {}", port)))?;
    let inner_tag = get_string(&mut params, "reproxy inner tag")
        .map_err(|e| ConnectorError::BadParams(e.to_string()))?;
    let inner_params = get_block(&mut params, "reproxy inner parameters")
        .map_err(|e| ConnectorError::BadParams(e.to_string()))?;
    Ok((Address::new(host, port), inner_tag, inner_params))
}

/// Client-side registry entry for a fixed next hop and inner type.
pub struct ReproxyClientConfigurator {
    next_hop: Address,
    inner_tag: String,
    inner_params: Bytes,
}

impl ReproxyClientConfigurator {
    pub fn new(next_hop: Address, inner_tag: impl Into<String>) -> Self {
        Self::with_params(next_hop, inner_tag, Bytes::new())
    }

    pub fn with_params(
        next_hop: Address,
        inner_tag: impl Into<String>,
        inner_params: Bytes,
    ) -> Self {
        Self {
            next_hop,
            inner_tag: inner_tag.into(),
            inner_params,
        }
    }
}

impl ClientConfigurator for ReproxyClientConfigurator {
    fn encode(&self, _tag: &str, out: &mut BytesMut) -> Result<(), ConnectorError> {
        out.extend_from_slice(&reproxy_params(
            &self.next_hop,
            &self.inner_tag,
            &self.inner_params,
        ));
        Ok(())
    }
}

/// Relay-side registry entry that resolves destinations through a nested
/// tunnel client instead of connecting locally.
#[derive(Default)]
pub struct ReproxyConfigurator {
    clients: Mutex<HashMap<Address, Arc<TunnelClient>>>,
}

impl ReproxyConfigurator {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, next_hop: &Address) -> Result<Arc<TunnelClient>, ConnectorError> {
        let mut cache = self.clients.lock().unwrap();
        if let Some(client) = cache.get(next_hop) {
            return Ok(client.clone());
        }
        info!("Creating nested tunnel client for hop {}", next_hop);
        let client = Arc::new(
            TunnelClient::builder()
                .relay(next_hop.to_string())
                .build()
                .map_err(|e| ConnectorError::Upstream(e.to_string()))?,
        );
        cache.insert(next_hop.clone(), client.clone());
        Ok(client)
    }
}

impl ServerConfigurator for ReproxyConfigurator {
    fn configure(
        &self,
        _tag: &str,
        params: Bytes,
    ) -> Result<Arc<dyn ConnectorFactory>, ConnectorError> {
        let (next_hop, inner_tag, inner_params) = decode_params(params)?;
        let client = self.client_for(&next_hop)?;
        Ok(Arc::new(ReproxyFactory {
            client,
            inner_tag,
            inner_params,
        }))
    }
}

/// Adapts one nested tunnel stream to the destination-connector contract.
struct ReproxyFactory {
    client: Arc<TunnelClient>,
    inner_tag: String,
    inner_params: Bytes,
}

#[async_trait]
impl ConnectorFactory for ReproxyFactory {
    async fn connect(&self, dest: &Address) -> Result<ConnectorHandle, ConnectorError> {
        let stream = self
            .client
            .connect_with_params(dest.clone(), &self.inner_tag, self.inner_params.clone())
            .await
            .map_err(|e| ConnectorError::Upstream(e.to_string()))?;
        debug!("Reproxied connection {} toward {}", stream.id(), dest);

        let (sender, mut inner_events) = stream.split();
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ConnectorEvent>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if sender.send(&data).await.is_err() {
                    break;
                }
            }
            sender.close().await;
        });

        tokio::spawn(async move {
            while let Some(event) = inner_events.recv().await {
                let done = match event {
                    // The outer flow was reported open when its own NEW
                    // frame went out; the nested Connected is redundant.
                    StreamEvent::Connected => continue,
                    StreamEvent::Data(data) => {
                        event_tx.send(ConnectorEvent::Data(data)).await.is_err()
                    }
                    StreamEvent::Closed => {
                        let _ = event_tx.send(ConnectorEvent::Closed).await;
                        true
                    }
                    StreamEvent::Failed(reason) => {
                        let _ = event_tx.send(ConnectorEvent::Failed(reason)).await;
                        true
                    }
                };
                if done {
                    break;
                }
            }
        });

        Ok(ConnectorHandle::new(input_tx, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_roundtrip() {
        let hop = Address::new("hop.example", 6666);
        let inner = reproxy_params(&Address::new("deep.example", 7777), "udp", b"");
        let params = reproxy_params(&hop, "reproxy", &inner);

        let (decoded_hop, tag, inner_params) = decode_params(params).unwrap();
        assert_eq!(decoded_hop, hop);
        assert_eq!(tag, "reproxy");
        // The inner block survives untouched, so chains nest freely.
        assert_eq!(inner_params, inner);
    }

    #[test]
    fn test_truncated_params_rejected() {
        let params = reproxy_params(&Address::new("hop.example", 6666), "tcp", b"");
        let cut = params.slice(..params.len() - 2);
        assert!(matches!(
            decode_params(cut),
            Err(ConnectorError::BadParams(_))
        ));
    }

    #[test]
    fn test_nested_clients_cached_per_hop() {
        let configurator = ReproxyConfigurator::new();
        let hop = Address::new("127.0.0.1", 6000);
        let a = configurator.client_for(&hop).unwrap();
        let b = configurator.client_for(&hop).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = configurator.client_for(&Address::new("127.0.0.1", 6001)).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
