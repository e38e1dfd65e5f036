//! Shared registry of channels and the peers joined to them.
//!
//! The [`Hub`] exclusively owns the `channel_id -> peer_id -> Peer` mapping.
//! Every mutation takes the write lock; [`Hub::broadcast`] and
//! [`Hub::list_peer_ids`] take the read lock only long enough to copy out the
//! targets. No stream write ever happens with the lock held.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::message::{Envelope, write_envelope};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// How long one broadcast write may wait on a peer before the peer is dropped.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-unique identity of one accepted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    fn next() -> Self {
        Self(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to the outbound half of a stream.
///
/// Clones refer to the same stream. Writes are serialized through a mutex so
/// an envelope from a broadcast never interleaves with one from the owning
/// dispatcher. Closing the handle is how the registry tells the owning
/// dispatcher to stop reading.
#[derive(Clone)]
pub struct StreamHandle {
    id: StreamId,
    writer: Arc<Mutex<BoxedWriter>>,
    closed: CancellationToken,
    raw: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: StreamId::next(),
            writer: Arc::new(Mutex::new(Box::new(writer))),
            closed: CancellationToken::new(),
            raw: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Writes one envelope. Fails once the stream has switched to raw bytes.
    pub async fn send(&self, envelope: &Envelope) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if self.raw.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream is carrying raw data",
            ));
        }
        write_envelope(&mut *writer, envelope).await
    }

    /// Stops envelope delivery so raw bytes written afterwards arrive alone.
    pub fn begin_raw_transfer(&self) {
        self.raw.store(true, Ordering::Release);
    }

    /// Copies `reader` to the stream in one locked section and returns the
    /// number of bytes written.
    pub async fn send_from<R>(&self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut writer = self.writer.lock().await;
        let copied = tokio::io::copy(reader, &mut *writer).await?;
        writer.flush().await?;
        Ok(copied)
    }

    /// Signals the owning dispatcher to stop. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`StreamHandle::close`] has been called on any clone.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Finishes the outbound half so the remote reader sees end-of-stream.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry entry for one `(channel, peer)` pair.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: String,
    pub stream: StreamHandle,
    pub last_seen: Instant,
}

/// New membership of a channel that changed and still has peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub channel_id: String,
    pub peer_ids: Vec<String>,
}

/// Outcome of one [`Hub::sweep_expired`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// `(channel_id, peer_id)` of every evicted peer.
    pub evicted: Vec<(String, String)>,
    /// Channels dropped because no peers remained.
    pub removed_channels: Vec<String>,
    /// Channels that lost peers but still have members.
    pub updated: Vec<ChannelUpdate>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub channels: usize,
    pub peers: usize,
}

type PeerMap = BTreeMap<String, Peer>;

pub struct Hub {
    channels: RwLock<HashMap<String, PeerMap>>,
    send_timeout: Duration,
}

impl Default for Hub {
    fn default() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub that gives up on a broadcast target after `send_timeout`.
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            channels: RwLock::default(),
            send_timeout,
        }
    }

    /// Binds `peer_id` in `channel_id` to `stream`, creating the channel on
    /// first join. An existing entry for the same peer is replaced and its
    /// `last_seen` reset. Returns the channel's peer ids after the insert.
    pub async fn register_peer(
        &self,
        channel_id: &str,
        peer_id: &str,
        stream: StreamHandle,
    ) -> Vec<String> {
        let mut channels = self.channels.write().await;
        let peers = channels.entry(channel_id.to_string()).or_default();

        let replaced = peers.insert(
            peer_id.to_string(),
            Peer {
                peer_id: peer_id.to_string(),
                stream,
                last_seen: Instant::now(),
            },
        );
        if let Some(previous) = replaced {
            debug!(
                channel = %channel_id,
                peer = %peer_id,
                previous = %previous.stream.id(),
                "peer re-registered"
            );
        }

        peers.keys().cloned().collect()
    }

    /// Refreshes `last_seen`. Returns false when the peer is not registered,
    /// which is normal if it was evicted concurrently.
    pub async fn touch_peer(&self, channel_id: &str, peer_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        match channels
            .get_mut(channel_id)
            .and_then(|peers| peers.get_mut(peer_id))
        {
            Some(peer) => {
                peer.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes `peer_id` from `channel_id` if it is still bound to `stream`.
    ///
    /// Returns the remaining peer ids when the entry was removed and the
    /// channel survives; an emptied channel is dropped and yields an empty list.
    pub async fn remove_peer(
        &self,
        channel_id: &str,
        peer_id: &str,
        stream: StreamId,
    ) -> Option<Vec<String>> {
        let mut channels = self.channels.write().await;
        let peers = channels.get_mut(channel_id)?;
        if peers.get(peer_id).map(|peer| peer.stream.id()) != Some(stream) {
            return None;
        }
        peers.remove(peer_id);

        let remaining: Vec<String> = peers.keys().cloned().collect();
        if remaining.is_empty() {
            channels.remove(channel_id);
            info!(channel = %channel_id, "removing empty channel");
        }
        Some(remaining)
    }

    /// Drops every entry bound to `stream` and reports the channels that still
    /// have members afterwards.
    pub async fn release_stream(&self, stream: StreamId) -> Vec<ChannelUpdate> {
        let mut channels = self.channels.write().await;
        let mut updates = Vec::new();

        channels.retain(|channel_id, peers| {
            let before = peers.len();
            peers.retain(|_, peer| peer.stream.id() != stream);
            if peers.len() == before {
                return true;
            }
            if peers.is_empty() {
                info!(channel = %channel_id, "removing empty channel");
                return false;
            }
            updates.push(ChannelUpdate {
                channel_id: channel_id.clone(),
                peer_ids: peers.keys().cloned().collect(),
            });
            true
        });

        updates
    }

    /// Writes `envelope` to every stream registered in `channel_id` except
    /// `exclude`. Failed targets are logged and skipped; a target that does not
    /// accept the write within the send timeout is closed.
    pub async fn broadcast(
        &self,
        channel_id: &str,
        envelope: &Envelope,
        exclude: Option<StreamId>,
    ) -> BroadcastReport {
        let targets: Vec<(String, StreamHandle)> = {
            let channels = self.channels.read().await;
            match channels.get(channel_id) {
                Some(peers) => peers
                    .values()
                    .filter(|peer| Some(peer.stream.id()) != exclude)
                    .map(|peer| (peer.peer_id.clone(), peer.stream.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        if targets.is_empty() {
            info!(channel = %channel_id, "no peers in channel to broadcast to");
            return BroadcastReport::default();
        }

        let send_timeout = self.send_timeout;
        let writes = targets.iter().map(|(peer_id, stream)| async move {
            let result = match timeout(send_timeout, stream.send(envelope)).await {
                Ok(result) => result,
                Err(_) => {
                    // A half-written envelope cannot be resumed.
                    stream.close();
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "peer stopped reading",
                    ))
                }
            };
            if let Err(err) = &result {
                warn!(
                    channel = %channel_id,
                    peer = %peer_id,
                    stream = %stream.id(),
                    error = %err,
                    "failed to deliver envelope"
                );
            }
            result.is_ok()
        });

        let mut report = BroadcastReport::default();
        for delivered in join_all(writes).await {
            if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Snapshot of the peer ids in `channel_id`, sorted.
    pub async fn list_peer_ids(&self, channel_id: &str) -> Vec<String> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Evicts every peer idle for longer than `ttl` as of `now`, closes its
    /// stream, and prunes channels left empty.
    pub async fn sweep_expired(&self, ttl: Duration, now: Instant) -> SweepReport {
        let mut channels = self.channels.write().await;
        let mut report = SweepReport::default();

        channels.retain(|channel_id, peers| {
            let before = peers.len();
            peers.retain(|peer_id, peer| {
                if now.saturating_duration_since(peer.last_seen) <= ttl {
                    return true;
                }
                info!(channel = %channel_id, peer = %peer_id, "removing inactive peer");
                peer.stream.close();
                report.evicted.push((channel_id.clone(), peer_id.clone()));
                false
            });

            if peers.is_empty() {
                info!(channel = %channel_id, "removing empty channel");
                report.removed_channels.push(channel_id.clone());
                return false;
            }
            if peers.len() != before {
                report.updated.push(ChannelUpdate {
                    channel_id: channel_id.clone(),
                    peer_ids: peers.keys().cloned().collect(),
                });
            }
            true
        });

        report
    }

    pub async fn stats(&self) -> HubStats {
        let channels = self.channels.read().await;
        HubStats {
            channels: channels.len(),
            peers: channels.values().map(BTreeMap::len).sum(),
        }
    }
}
