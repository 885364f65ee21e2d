//! Built-in plain-UDP connector

use crate::connector::{ConnectorError, ConnectorEvent, ConnectorHandle, CHANNEL_CAPACITY};
use crate::registry::ConnectorFactory;
use async_trait::async_trait;
use bytes::Bytes;
use muxtun_proto::Address;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// Binds an ephemeral socket connected to the destination and relays
/// datagrams both ways. UDP has no peer close, so the flow ends when the
/// logical connection closes or the socket errors.
pub struct UdpConnectorFactory;

#[async_trait]
impl ConnectorFactory for UdpConnectorFactory {
    async fn connect(&self, dest: &Address) -> Result<ConnectorHandle, ConnectorError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((dest.host.as_str(), dest.port)).await?;
        debug!("UDP connector open to {}", dest);

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ConnectorEvent>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
            loop {
                tokio::select! {
                    outbound = input_rx.recv() => match outbound {
                        Some(data) => {
                            if let Err(e) = socket.send(&data).await {
                                let _ = event_tx.send(ConnectorEvent::Failed(e.to_string())).await;
                                break;
                            }
                        }
                        None => {
                            let _ = event_tx.send(ConnectorEvent::Closed).await;
                            break;
                        }
                    },
                    inbound = socket.recv(&mut buf) => match inbound {
                        Ok(n) => {
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            if event_tx.send(ConnectorEvent::Data(chunk)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = event_tx.send(ConnectorEvent::Failed(e.to_string())).await;
                            break;
                        }
                    },
                }
            }
        });

        Ok(ConnectorHandle::new(input_tx, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_udp_echo() -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let addr = spawn_udp_echo().await;
        let handle = UdpConnectorFactory
            .connect(&Address::from(addr))
            .await
            .unwrap();
        let (input, mut events) = handle.split();

        input.send(Bytes::from_static(b"probe")).await.unwrap();
        match events.recv().await.unwrap() {
            ConnectorEvent::Data(data) => assert_eq!(&data[..], b"probe"),
            other => panic!("expected data, got {:?}", other),
        }

        drop(input);
        match events.recv().await.unwrap() {
            ConnectorEvent::Closed => {}
            other => panic!("expected closed, got {:?}", other),
        }
    }
}
