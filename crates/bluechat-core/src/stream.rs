//! Message stream over an established transport
//!
//! Inbound bytes are cut at read boundaries: every successful read becomes one
//! message. There is no framing, so a long message may arrive in several
//! pieces and a multi-byte character straddling two reads is decoded lossily
//! on both sides of the cut.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capability::Socket;
use crate::types::{ConnectionEvent, Message, REASON_CONNECTION_LOST};

/// Why a read loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Read error or end of stream; `Failed("Connection lost")` was emitted
    LinkLost,
    /// Nobody is consuming events any more
    ConsumerGone,
}

/// Reads and writes chat text on one socket
pub struct MessageStream {
    socket: Arc<dyn Socket>,
    chunk_size: usize,
}

impl MessageStream {
    pub fn new(socket: Arc<dyn Socket>, chunk_size: usize) -> Self {
        Self { socket, chunk_size }
    }

    /// Emit one `TransferSucceeded` per inbound chunk until the link drops
    pub async fn run(&self, events: &mpsc::Sender<ConnectionEvent>) -> StreamEnd {
        let mut buffer = vec![0u8; self.chunk_size];
        let peer = self.socket.peer_address().to_string();

        loop {
            let received = match self.socket.read(&mut buffer).await {
                Ok(0) => {
                    info!("Peer {} closed the connection", peer);
                    None
                }
                Ok(n) if n > buffer.len() => {
                    warn!("Read from {} reported {} bytes into a {} byte buffer", peer, n, buffer.len());
                    None
                }
                Ok(n) => Some(n),
                Err(e) => {
                    info!("Read from {} failed: {}", peer, e);
                    None
                }
            };

            let event = match received {
                Some(n) => {
                    debug!("Received {} bytes from {}", n, peer);
                    let text = String::from_utf8_lossy(&buffer[..n]).into_owned();
                    ConnectionEvent::TransferSucceeded(Message::remote(text))
                }
                None => {
                    return match events.send(ConnectionEvent::failed(REASON_CONNECTION_LOST)).await {
                        Ok(()) => StreamEnd::LinkLost,
                        Err(_) => StreamEnd::ConsumerGone,
                    };
                }
            };

            if events.send(event).await.is_err() {
                debug!("Event consumer dropped, stopping read loop for {}", peer);
                return StreamEnd::ConsumerGone;
            }
        }
    }

    /// Best-effort send on this stream's socket
    pub async fn send(&self, text: &str) -> Option<Message> {
        send_text(self.socket.as_ref(), text).await
    }
}

/// Write `text` as raw UTF-8.
///
/// Returns `None` without raising anything when the socket is not connected
/// or the write fails; the read loop is what reports a dead link.
pub async fn send_text(socket: &dyn Socket, text: &str) -> Option<Message> {
    if !socket.is_connected() {
        debug!("Not sending to {}: socket disconnected", socket.peer_address());
        return None;
    }

    match socket.write(text.as_bytes()).await {
        Ok(()) => {
            debug!("Sent {} bytes to {}", text.len(), socket.peer_address());
            Some(Message::local(text))
        }
        Err(e) => {
            warn!("Dropped message to {}: {}", socket.peer_address(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::IoSocket;
    use crate::types::MessageSender;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_each_read_becomes_a_message() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let stream = MessageStream::new(IoSocket::new(local, "peer").into_shared(), 1024);
        let (tx, mut rx) = mpsc::channel(16);

        remote.write_all(b"hello").await.unwrap();
        let reader = tokio::spawn(async move { stream.run(&tx).await });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ConnectionEvent::TransferSucceeded(Message::new("hello", MessageSender::Remote))
        );

        drop(remote);
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Failed("Connection lost".into())
        );
        assert_eq!(reader.await.unwrap(), StreamEnd::LinkLost);
    }

    #[tokio::test]
    async fn test_chunks_are_bounded() {
        let (local, mut remote) = tokio::io::duplex(8192);
        let stream = MessageStream::new(IoSocket::new(local, "peer").into_shared(), 1024);
        let (tx, mut rx) = mpsc::channel(16);

        remote.write_all(&vec![b'x'; 2500]).await.unwrap();
        drop(remote);
        stream.run(&tx).await;
        drop(tx);

        let mut total = 0;
        while let Some(event) = rx.recv().await {
            if let ConnectionEvent::TransferSucceeded(message) = event {
                assert!(message.text.len() <= 1024);
                total += message.text.len();
            }
        }
        assert_eq!(total, 2500);
    }

    #[tokio::test]
    async fn test_split_multibyte_is_decoded_lossily() {
        let (local, mut remote) = tokio::io::duplex(64);
        let stream = MessageStream::new(IoSocket::new(local, "peer").into_shared(), 2);
        let (tx, mut rx) = mpsc::channel(16);

        // "é" is two bytes; with a chunk of two and a leading 'a' it gets cut
        remote.write_all("aé".as_bytes()).await.unwrap();
        drop(remote);
        stream.run(&tx).await;

        let first = rx.recv().await.unwrap();
        let ConnectionEvent::TransferSucceeded(message) = first else {
            panic!("expected a message, got {first:?}");
        };
        assert!(message.text.starts_with('a'));
        assert!(message.text.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn test_send_on_closed_socket_returns_none() {
        let (local, _remote) = tokio::io::duplex(64);
        let socket = IoSocket::new(local, "peer").into_shared();
        socket.close();
        assert!(send_text(socket.as_ref(), "x").await.is_none());
    }

    #[tokio::test]
    async fn test_send_returns_local_message() {
        let (local, _remote) = tokio::io::duplex(64);
        let stream = MessageStream::new(IoSocket::new(local, "peer").into_shared(), 1024);
        let sent = stream.send("hello").await.unwrap();
        assert_eq!(sent, Message::local("hello"));
        assert!(sent.is_from_local_user());
    }

    /// Claims to have read more bytes than the buffer holds
    struct OverreportingSocket;

    #[async_trait::async_trait]
    impl Socket for OverreportingSocket {
        async fn read(&self, buf: &mut [u8]) -> crate::errors::Result<usize> {
            Ok(buf.len() + 10)
        }

        async fn write(&self, _data: &[u8]) -> crate::errors::Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn close(&self) {}

        fn peer_address(&self) -> &str {
            "liar"
        }
    }

    #[tokio::test]
    async fn test_oversized_read_count_ends_stream() {
        let stream = MessageStream::new(Arc::new(OverreportingSocket), 16);
        let (tx, mut rx) = mpsc::channel(4);

        assert_eq!(stream.run(&tx).await, StreamEnd::LinkLost);
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::Failed("Connection lost".into())
        );
    }
}
