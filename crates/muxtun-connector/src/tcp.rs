//! Built-in plain-TCP connector

use crate::connector::{ConnectorError, ConnectorEvent, ConnectorHandle, CHANNEL_CAPACITY};
use crate::registry::ConnectorFactory;
use async_trait::async_trait;
use bytes::Bytes;
use muxtun_proto::Address;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Connects a plain TCP stream to the destination and pumps both
/// directions until either side finishes.
pub struct TcpConnectorFactory;

#[async_trait]
impl ConnectorFactory for TcpConnectorFactory {
    async fn connect(&self, dest: &Address) -> Result<ConnectorHandle, ConnectorError> {
        let stream = TcpStream::connect((dest.host.as_str(), dest.port)).await?;
        debug!("TCP connector open to {}", dest);

        let (read_half, mut write_half) = stream.into_split();
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ConnectorEvent>(CHANNEL_CAPACITY);

        // Outbound: tunnel bytes toward the destination. A dropped sender
        // means the logical connection closed; shut the write side down so
        // the destination sees a clean EOF.
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Inbound: destination bytes toward the tunnel.
        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = event_tx.send(ConnectorEvent::Closed).await;
                        break;
                    }
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
                }
            }
        });

        Ok(ConnectorHandle::new(input_tx, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_echo() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let addr = spawn_echo().await;
        let handle = TcpConnectorFactory
            .connect(&Address::from(addr))
            .await
            .unwrap();
        let (input, mut events) = handle.split();

        input.send(Bytes::from_static(b"hello")).await.unwrap();
        match events.recv().await.unwrap() {
            ConnectorEvent::Data(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("expected data, got {:?}", other),
        }

        // Dropping the sender closes the write side; the echo server then
        // closes and the event stream ends with Closed.
        drop(input);
        match events.recv().await.unwrap() {
            ConnectorEvent::Closed => {}
            other => panic!("expected closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnectorFactory.connect(&Address::from(addr)).await;
        assert!(matches!(result, Err(ConnectorError::Io(_))));
    }
}
