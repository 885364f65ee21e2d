//! Wire frame codec
//!
//! Every frame starts with `connection_id:u32` followed by
//! `marker_or_length:i32`, both big-endian. A positive marker is a DATA
//! length; zero and negative markers are control values whose meaning
//! depends on direction:
//!
//! - client to relay: `0` = NEW (host, port, type tag, parameters follow),
//!   negative = CLOSE
//! - relay to client: `0` = CLOSE, negative = FAIL
//!
//! The same wire value means different things per direction, so the codec
//! exposes one decoded enum per reader: [`ClientFrame`] for the relay's
//! inbound stream and [`RelayFrame`] for the client's.
//!
//! Frames carry no outer length prefix, so all writes to one link must be
//! serialized; interleaved partial writes corrupt the stream.

use crate::{Address, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Control marker shared by client-side CLOSE and relay-side FAIL.
const CONTROL_MARKER: i32 = -1;

/// Protocol errors.
///
/// Everything here except [`ProtoError::BadTransition`] means framing
/// trust in the link is lost; the link must be torn down.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("Invalid UTF-8 in {0}")]
    BadString(&'static str),

    #[error("Port {0} out of range")]
    BadPort(u32),

    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Phase transition {0:?} -> {1:?} not allowed")]
    BadTransition(crate::Phase, crate::Phase),
}

/// A frame read by the relay off its inbound stream.
#[derive(Debug)]
pub enum ClientFrame {
    New {
        id: u32,
        dest: Address,
        tag: String,
        params: Bytes,
    },
    Data {
        id: u32,
        payload: Bytes,
    },
    Close {
        id: u32,
    },
}

/// A frame read by the client off its inbound stream.
#[derive(Debug)]
pub enum RelayFrame {
    Data { id: u32, payload: Bytes },
    Close { id: u32 },
    Fail { id: u32 },
}

fn check_len(len: u32, what: &'static str) -> Result<usize, ProtoError> {
    if len > MAX_FRAME_SIZE {
        tracing::warn!("Oversized {} of {} bytes on link", what, len);
        return Err(ProtoError::FrameTooLarge(len as usize));
    }
    Ok(len as usize)
}

async fn read_string<R>(reader: &mut R, what: &'static str) -> Result<String, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let len = check_len(reader.read_u32().await?, what)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtoError::BadString(what))
}

async fn read_block<R>(reader: &mut R, what: &'static str) -> Result<Bytes, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let len = check_len(reader.read_u32().await?, what)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read one frame as the relay: NEW / DATA / CLOSE.
pub async fn read_client_frame<R>(reader: &mut R) -> Result<ClientFrame, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let id = reader.read_u32().await?;
    let marker = reader.read_i32().await?;

    if marker < 0 {
        return Ok(ClientFrame::Close { id });
    }

    if marker == 0 {
        let host = read_string(reader, "destination host").await?;
        let port = reader.read_u32().await?;
        let port = u16::try_from(port).map_err(|_| ProtoError::BadPort(port))?;
        let tag = read_string(reader, "type tag").await?;
        let params = read_block(reader, "type parameters").await?;
        return Ok(ClientFrame::New {
            id,
            dest: Address::new(host, port),
            tag,
            params,
        });
    }

    let len = check_len(marker as u32, "payload")?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(ClientFrame::Data {
        id,
        payload: Bytes::from(payload),
    })
}

/// Read one frame as the client: DATA / CLOSE / FAIL.
pub async fn read_relay_frame<R>(reader: &mut R) -> Result<RelayFrame, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let id = reader.read_u32().await?;
    let marker = reader.read_i32().await?;

    if marker < 0 {
        return Ok(RelayFrame::Fail { id });
    }

    if marker == 0 {
        return Ok(RelayFrame::Close { id });
    }

    let len = check_len(marker as u32, "payload")?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(RelayFrame::Data {
        id,
        payload: Bytes::from(payload),
    })
}

/// Write a NEW frame announcing a logical connection.
pub async fn write_new<W>(
    writer: &mut W,
    id: u32,
    dest: &Address,
    tag: &str,
    params: &[u8],
) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    if params.len() > MAX_FRAME_SIZE as usize {
        return Err(ProtoError::FrameTooLarge(params.len()));
    }

    let mut buf = BytesMut::with_capacity(8 + 12 + dest.host.len() + tag.len() + params.len() + 8);
    buf.put_u32(id);
    buf.put_i32(0);
    put_string(&mut buf, &dest.host);
    buf.put_u32(u32::from(dest.port));
    put_string(&mut buf, tag);
    buf.put_u32(params.len() as u32);
    buf.put_slice(params);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a DATA frame. Empty payloads are silently skipped: a zero length
/// would collide with the NEW/CLOSE marker value.
pub async fn write_data<W>(writer: &mut W, id: u32, payload: &[u8]) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Ok(());
    }
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32(id);
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_control<W>(writer: &mut W, id: u32, marker: i32) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(id);
    buf.put_i32(marker);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a CLOSE frame as the client (negative marker).
pub async fn write_client_close<W>(writer: &mut W, id: u32) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    write_control(writer, id, CONTROL_MARKER).await
}

/// Write a CLOSE frame as the relay (zero marker).
pub async fn write_relay_close<W>(writer: &mut W, id: u32) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    write_control(writer, id, 0).await
}

/// Write a FAIL frame (relay to client only).
pub async fn write_fail<W>(writer: &mut W, id: u32) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    write_control(writer, id, CONTROL_MARKER).await
}

/// Append a length-prefixed UTF-8 string to a parameter buffer.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Read a length-prefixed UTF-8 string out of a parameter buffer.
pub fn get_string(buf: &mut Bytes, what: &'static str) -> Result<String, ProtoError> {
    let len = check_len(get_u32(buf, what)?, what)?;
    if buf.remaining() < len {
        return Err(ProtoError::Truncated(what));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::BadString(what))
}

/// Read a big-endian u32 out of a parameter buffer.
pub fn get_u32(buf: &mut Bytes, what: &'static str) -> Result<u32, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated(what));
    }
    Ok(buf.get_u32())
}

/// Read a length-prefixed byte block out of a parameter buffer.
pub fn get_block(buf: &mut Bytes, what: &'static str) -> Result<Bytes, ProtoError> {
    let len = check_len(get_u32(buf, what)?, what)?;
    if buf.remaining() < len {
        return Err(ProtoError::Truncated(what));
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode_new(id: u32, dest: &Address, tag: &str, params: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_new(&mut buf, id, dest, tag, params).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_new_roundtrip() {
        let dest = Address::new("example.com", 443);
        let buf = encode_new(7, &dest, "tcp", b"extra").await;

        let frame = read_client_frame(&mut buf.as_slice()).await.unwrap();
        match frame {
            ClientFrame::New {
                id,
                dest: d,
                tag,
                params,
            } => {
                assert_eq!(id, 7);
                assert_eq!(d, dest);
                assert_eq!(tag, "tcp");
                assert_eq!(&params[..], b"extra");
            }
            other => panic!("expected NEW, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_roundtrip_both_directions() {
        let mut buf = Vec::new();
        write_data(&mut buf, 3, b"ping").await.unwrap();

        match read_client_frame(&mut buf.as_slice()).await.unwrap() {
            ClientFrame::Data { id, payload } => {
                assert_eq!(id, 3);
                assert_eq!(&payload[..], b"ping");
            }
            other => panic!("expected DATA, got {:?}", other),
        }
        match read_relay_frame(&mut buf.as_slice()).await.unwrap() {
            RelayFrame::Data { id, payload } => {
                assert_eq!(id, 3);
                assert_eq!(&payload[..], b"ping");
            }
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_data_writes_nothing() {
        let mut buf = Vec::new();
        write_data(&mut buf, 3, b"").await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_control_markers_per_direction() {
        let mut buf = Vec::new();
        write_client_close(&mut buf, 9).await.unwrap();
        match read_client_frame(&mut buf.as_slice()).await.unwrap() {
            ClientFrame::Close { id } => assert_eq!(id, 9),
            other => panic!("expected CLOSE, got {:?}", other),
        }
        // The same negative marker read by the client means FAIL.
        match read_relay_frame(&mut buf.as_slice()).await.unwrap() {
            RelayFrame::Fail { id } => assert_eq!(id, 9),
            other => panic!("expected FAIL, got {:?}", other),
        }

        let mut buf = Vec::new();
        write_relay_close(&mut buf, 4).await.unwrap();
        match read_relay_frame(&mut buf.as_slice()).await.unwrap() {
            RelayFrame::Close { id } => assert_eq!(id, 4),
            other => panic!("expected CLOSE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_new_is_an_error() {
        let dest = Address::new("example.com", 443);
        let buf = encode_new(1, &dest, "tcp", b"").await;
        let cut = &buf[..buf.len() - 3];
        assert!(read_client_frame(&mut &cut[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i32(0);
        buf.put_u32(MAX_FRAME_SIZE + 1); // host length
        let raw = buf.freeze().to_vec();
        match read_client_frame(&mut raw.as_slice()).await {
            Err(ProtoError::FrameTooLarge(_)) => {}
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_utf8_host_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i32(0);
        buf.put_u32(2);
        buf.put_slice(&[0xff, 0xfe]);
        let raw = buf.freeze().to_vec();
        match read_client_frame(&mut raw.as_slice()).await {
            Err(ProtoError::BadString(_)) => {}
            other => panic!("expected BadString, got {:?}", other),
        }
    }

    #[test]
    fn test_param_buffer_helpers() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "next-hop.example");
        buf.put_u32(9001);
        let mut bytes = buf.freeze();

        assert_eq!(get_string(&mut bytes, "host").unwrap(), "next-hop.example");
        assert_eq!(get_u32(&mut bytes, "port").unwrap(), 9001);
        assert!(get_u32(&mut bytes, "port").is_err());
    }
}
