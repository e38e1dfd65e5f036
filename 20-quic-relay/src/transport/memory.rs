//! In-process sessions over `tokio::io::duplex` pipes.
//!
//! Behaves like a real session from the acceptor's point of view: streams
//! arrive in the order the connector opens them, and closing either end ends
//! the session. Useful for driving the relay without sockets.

use anyhow::{Result, anyhow};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::Session;

const PIPE_CAPACITY: usize = 64 * 1024;
const PENDING_STREAMS: usize = 32;

type StreamHalves = (WriteHalf<DuplexStream>, ReadHalf<DuplexStream>);

/// Creates a connected pair: the connector opens streams, the session accepts
/// them.
pub fn session_pair(label: impl Into<String>) -> (MemoryConnector, MemorySession) {
    let (streams_tx, streams_rx) = mpsc::channel(PENDING_STREAMS);
    let closed = CancellationToken::new();
    (
        MemoryConnector {
            streams_tx,
            closed: closed.clone(),
        },
        MemorySession {
            label: label.into(),
            streams_rx: Mutex::new(streams_rx),
            closed,
        },
    )
}

/// The remote peer's end of an in-process session.
#[derive(Clone)]
pub struct MemoryConnector {
    streams_tx: mpsc::Sender<StreamHalves>,
    closed: CancellationToken,
}

impl MemoryConnector {
    /// Opens a new stream and returns the peer's `(send, recv)` halves.
    pub async fn open_stream(&self) -> Result<StreamHalves> {
        if self.closed.is_cancelled() {
            return Err(anyhow!("session closed"));
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_recv, remote_send) = tokio::io::split(remote);
        self.streams_tx
            .send((remote_send, remote_recv))
            .await
            .map_err(|_| anyhow!("session closed"))?;

        let (local_recv, local_send) = tokio::io::split(local);
        Ok((local_send, local_recv))
    }

    /// Closes the session from the peer's side.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

pub struct MemorySession {
    label: String,
    streams_rx: Mutex<mpsc::Receiver<StreamHalves>>,
    closed: CancellationToken,
}

#[async_trait::async_trait]
impl Session for MemorySession {
    type SendStream = WriteHalf<DuplexStream>;
    type RecvStream = ReadHalf<DuplexStream>;

    async fn accept_stream(&self) -> Result<(Self::SendStream, Self::RecvStream)> {
        let mut streams = self.streams_rx.lock().await;
        select! {
            _ = self.closed.cancelled() => Err(anyhow!("session closed")),
            next = streams.recv() => next.ok_or_else(|| anyhow!("connector dropped")),
        }
    }

    fn remote_label(&self) -> String {
        self.label.clone()
    }

    fn close(&self, _reason: &str) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn streams_connect_both_directions() {
        let (connector, session) = session_pair("test");
        let (mut peer_send, mut peer_recv) = connector.open_stream().await.unwrap();
        let (mut server_send, mut server_recv) = session.accept_stream().await.unwrap();

        peer_send.write_all(b"ping").await.unwrap();
        peer_send.shutdown().await.unwrap();
        let mut got = Vec::new();
        server_recv.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        server_send.write_all(b"pong").await.unwrap();
        drop(server_send);
        drop(server_recv);
        let mut got = Vec::new();
        peer_recv.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"pong");
    }

    #[tokio::test]
    async fn accept_fails_after_close() {
        let (connector, session) = session_pair("test");
        connector.close();
        assert!(session.accept_stream().await.is_err());
        assert!(connector.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn accept_fails_when_connector_dropped() {
        let (connector, session) = session_pair("test");
        drop(connector);
        assert!(session.accept_stream().await.is_err());
    }
}
