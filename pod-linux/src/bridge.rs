//! Radio bridge: TCP link to the BLE bridge (or a test PDM), one length-prefixed packet per frame.

use std::net::SocketAddr;

use async_trait::async_trait;
use pod_core::message::Message;
use pod_core::wire::{encode_frame, frame_len, FrameDecodeError};
use pod_core::{Transport, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

const LEN_SIZE: usize = 4;

/// Accepts one bridge connection at a time; the session engine drives reads and writes.
pub struct TcpBridge {
    listener: TcpListener,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    advertised: Mutex<Option<Vec<u8>>>,
}

impl TcpBridge {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            advertised: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Id last passed to `refresh_advertising`.
    pub async fn advertised_id(&self) -> Option<Vec<u8>> {
        self.advertised.lock().await.clone()
    }

    async fn read_frame(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut len_buf = [0u8; LEN_SIZE];
        reader.read_exact(&mut len_buf).await.map_err(eof_is_closed)?;
        let len = frame_len(len_buf)?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(eof_is_closed)?;
        trace!(len, "frame in");
        Ok(body)
    }
}

fn eof_is_closed(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

#[async_trait]
impl Transport for TcpBridge {
    async fn read_first_command(&self) -> Result<Vec<u8>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "bridge connected");
        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        self.read_frame().await
    }

    async fn start_message_loop(&self) -> Result<(), TransportError> {
        // Frames are read on demand by the session.
        debug!("message loop started");
        Ok(())
    }

    async fn read_message(&self) -> Result<Message, TransportError> {
        let body = self.read_frame().await?;
        let msg = Message::decode(&body).map_err(FrameDecodeError::from)?;
        trace!(seq = msg.sequence_number, ty = ?msg.message_type, "packet in");
        Ok(msg)
    }

    async fn write_message(&self, msg: &Message) -> Result<(), TransportError> {
        let frame = encode_frame(msg)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!(seq = msg.sequence_number, "packet out");
        Ok(())
    }

    async fn shutdown_connection(&self) {
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                warn!(error = %e, "bridge shutdown");
            }
        }
        info!("bridge connection closed");
    }

    async fn refresh_advertising(&self, id: &[u8]) -> Result<(), TransportError> {
        info!(id = ?id, "advertising with assigned id");
        *self.advertised.lock().await = Some(id.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pod_core::wire::{decode_frame, encode_raw_frame};
    use pod_core::MessageType;
    use tokio::net::TcpStream;

    async fn bridge() -> (TcpBridge, SocketAddr) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (TcpBridge::from_listener(listener), addr)
    }

    #[tokio::test]
    async fn first_command_then_packets() {
        let (bridge, addr) = bridge().await;
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&encode_raw_frame(b"hello").unwrap()).await.unwrap();
            let mut msg = Message::new(MessageType::Pairing, 0x1092, 0x1093, b"SP0GP0".to_vec());
            msg.sequence_number = 7;
            stream.write_all(&encode_frame(&msg).unwrap()).await.unwrap();

            let mut buf = vec![0u8; 256];
            let mut got = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            got
        });

        assert_eq!(bridge.read_first_command().await.unwrap(), b"hello");
        bridge.start_message_loop().await.unwrap();
        let msg = bridge.read_message().await.unwrap();
        assert_eq!(msg.sequence_number, 7);
        assert_eq!(msg.payload, b"SP0GP0");

        let reply = msg.reply(MessageType::Pairing, 1, b"P0=".to_vec());
        bridge.write_message(&reply).await.unwrap();
        bridge.shutdown_connection().await;

        let bytes = client.await.unwrap();
        let (decoded, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, reply);
        assert!(matches!(bridge.read_message().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn peer_hangup_reads_as_closed() {
        let (bridge, addr) = bridge().await;
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&encode_raw_frame(b"x").unwrap()).await.unwrap();
        });
        bridge.read_first_command().await.unwrap();
        client.await.unwrap();
        assert!(matches!(bridge.read_message().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (bridge, addr) = bridge().await;
        let _client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&encode_raw_frame(b"x").unwrap()).await.unwrap();
            stream.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        bridge.read_first_command().await.unwrap();
        assert!(matches!(
            bridge.read_message().await,
            Err(TransportError::Decode(FrameDecodeError::TooLarge))
        ));
    }

    #[tokio::test]
    async fn refresh_advertising_records_id() {
        let (bridge, _) = bridge().await;
        bridge.refresh_advertising(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(bridge.advertised_id().await, Some(vec![1, 2, 3, 4]));
    }
}
