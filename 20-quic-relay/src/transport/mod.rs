//! Multiplexed transports the relay can accept sessions from.
//!
//! A [`Session`] is one connection from a remote peer that yields any number
//! of ordered bidirectional streams. [`quic`] is the network implementation;
//! [`memory`] runs sessions over in-process pipes.

pub mod memory;
pub mod quic;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};

/// One multiplexed connection from a remote peer.
#[async_trait::async_trait]
pub trait Session: Send + Sync + 'static {
    /// The outbound half of an accepted stream.
    type SendStream: AsyncWrite + Send + Unpin + 'static;
    /// The inbound half of an accepted stream.
    type RecvStream: AsyncRead + Send + Unpin + 'static;

    /// Waits for the remote peer to open the next stream.
    ///
    /// An error means the session is gone and no further streams will arrive.
    async fn accept_stream(&self) -> Result<(Self::SendStream, Self::RecvStream)>;

    /// Human-readable identity of the remote end, for logs.
    fn remote_label(&self) -> String;

    /// Tears the session down, resetting any streams still open.
    fn close(&self, reason: &str);
}
