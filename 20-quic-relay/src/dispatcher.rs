//! Per-stream protocol state machine.
//!
//! A dispatcher owns one accepted stream. It decodes envelopes one at a time,
//! executes each against the [`Hub`] or the [`BlobStore`], and stops on
//! end-of-stream, a decode error, or a forced close from the eviction sweep.
//! Nothing that goes wrong here escapes the task: failures end this stream only.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::select;
use tracing::{debug, info, warn};

use crate::hub::{ChannelUpdate, Hub, StreamHandle};
use crate::message::{DEFAULT_MAX_ENVELOPE_BYTES, DecodeError, Envelope, EnvelopeReader, MessageKind};
use crate::store::BlobStore;

/// Default cap on a single upload body.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    pub max_envelope_bytes: usize,
    pub max_upload_bytes: u64,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// Everything a dispatcher needs besides its own stream.
#[derive(Clone)]
pub struct RelayContext {
    pub hub: Arc<Hub>,
    pub store: Arc<dyn BlobStore>,
    pub limits: DispatchLimits,
}

impl RelayContext {
    pub fn new(hub: Arc<Hub>, store: Arc<dyn BlobStore>, limits: DispatchLimits) -> Self {
        Self { hub, store, limits }
    }
}

enum State {
    AwaitingFirstEnvelope,
    Dispatch(Envelope),
    AwaitingNextEnvelope,
    Closed,
}

/// Whether the stream can carry further envelopes after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finish,
}

pub struct Dispatcher<R> {
    reader: EnvelopeReader<R>,
    stream: StreamHandle,
    ctx: RelayContext,
}

impl<R> Dispatcher<R>
where
    R: AsyncRead + Send + Unpin,
{
    pub fn new(recv: R, stream: StreamHandle, ctx: RelayContext) -> Self {
        Self {
            reader: EnvelopeReader::with_limit(recv, ctx.limits.max_envelope_bytes),
            stream,
            ctx,
        }
    }

    /// Drives the stream until it closes, then releases its registrations.
    pub async fn run(mut self) {
        let mut state = State::AwaitingFirstEnvelope;
        loop {
            state = match state {
                State::AwaitingFirstEnvelope => match self.next_envelope().await {
                    Some(envelope) => State::Dispatch(envelope),
                    None => State::Closed,
                },
                State::AwaitingNextEnvelope => match self.next_envelope().await {
                    Some(envelope) => {
                        self.ctx
                            .hub
                            .touch_peer(&envelope.channel_id, &envelope.sender_id)
                            .await;
                        State::Dispatch(envelope)
                    }
                    None => State::Closed,
                },
                State::Dispatch(envelope) => match self.dispatch(envelope).await {
                    Flow::Continue => State::AwaitingNextEnvelope,
                    Flow::Finish => State::Closed,
                },
                State::Closed => break,
            };
        }

        self.close().await;
    }

    async fn next_envelope(&mut self) -> Option<Envelope> {
        let stream_id = self.stream.id();
        let decoded = select! {
            biased;
            _ = self.stream.closed() => {
                info!(stream = %stream_id, "stream closed by eviction");
                return None;
            }
            decoded = self.reader.next_envelope() => decoded,
        };

        match decoded {
            Ok(Some(envelope)) => Some(envelope),
            Ok(None) => {
                debug!(stream = %stream_id, "stream finished by peer");
                None
            }
            Err(DecodeError::Io(err)) => {
                info!(stream = %stream_id, error = %err, "stream read failed");
                None
            }
            Err(err) => {
                warn!(stream = %stream_id, error = %err, "error decoding envelope");
                None
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Flow {
        match envelope.kind() {
            MessageKind::Join => self.join(envelope).await,
            MessageKind::Leave => self.leave(envelope).await,
            MessageKind::Heartbeat => self.heartbeat(envelope).await,
            MessageKind::Upload => self.upload(envelope).await,
            MessageKind::Download => self.download(envelope).await,
            MessageKind::Remove => self.remove(envelope).await,
            // Server-originated types coming from a peer are relayed like any
            // other message.
            MessageKind::Message | MessageKind::UserList | MessageKind::Error => {
                self.relay(envelope).await
            }
        }
    }

    async fn join(&mut self, envelope: Envelope) -> Flow {
        info!(
            peer = %envelope.sender_id,
            channel = %envelope.channel_id,
            stream = %self.stream.id(),
            "peer joining channel"
        );
        let peer_ids = self
            .ctx
            .hub
            .register_peer(&envelope.channel_id, &envelope.sender_id, self.stream.clone())
            .await;
        announce_members(&self.ctx.hub, &envelope.channel_id, &peer_ids).await;
        Flow::Continue
    }

    async fn leave(&mut self, envelope: Envelope) -> Flow {
        let remaining = self
            .ctx
            .hub
            .remove_peer(&envelope.channel_id, &envelope.sender_id, self.stream.id())
            .await;
        match remaining {
            Some(peer_ids) => {
                info!(peer = %envelope.sender_id, channel = %envelope.channel_id, "peer left channel");
                if !peer_ids.is_empty() {
                    announce_members(&self.ctx.hub, &envelope.channel_id, &peer_ids).await;
                }
            }
            None => debug!(
                peer = %envelope.sender_id,
                channel = %envelope.channel_id,
                "leave for a peer not bound to this stream"
            ),
        }
        Flow::Continue
    }

    async fn heartbeat(&mut self, envelope: Envelope) -> Flow {
        let known = self
            .ctx
            .hub
            .touch_peer(&envelope.channel_id, &envelope.sender_id)
            .await;
        debug!(
            peer = %envelope.sender_id,
            channel = %envelope.channel_id,
            known,
            "heartbeat received"
        );
        Flow::Continue
    }

    async fn relay(&mut self, envelope: Envelope) -> Flow {
        debug!(
            peer = %envelope.sender_id,
            channel = %envelope.channel_id,
            kind = %envelope.message_type,
            "relaying message"
        );
        self.ctx
            .hub
            .broadcast(&envelope.channel_id, &envelope, Some(self.stream.id()))
            .await;
        Flow::Continue
    }

    async fn upload(&mut self, envelope: Envelope) -> Flow {
        let object_id = envelope.payload.as_str();
        info!(object = %object_id, stream = %self.stream.id(), "upload request received");

        let body = select! {
            biased;
            _ = self.stream.closed() => return Flow::Finish,
            body = self.reader.read_body(self.ctx.limits.max_upload_bytes) => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                warn!(object = %object_id, error = %err, "failed to read upload body");
                let reason = format!("upload of {object_id} failed: {err}");
                reply_error(&self.stream, &envelope, reason).await;
                return Flow::Finish;
            }
        };

        let size = body.len();
        match self.ctx.store.put(object_id, Bytes::from(body)).await {
            Ok(()) => info!(object = %object_id, bytes = size, "upload stored"),
            Err(err) => {
                warn!(object = %object_id, error = %err, "upload failed");
                let reason = format!("upload of {object_id} failed: {err}");
                reply_error(&self.stream, &envelope, reason).await;
            }
        }
        // The body ran to the end of the inbound half; the next read sees EOF.
        Flow::Continue
    }

    async fn download(&mut self, envelope: Envelope) -> Flow {
        let object_id = envelope.payload.as_str();
        info!(object = %object_id, stream = %self.stream.id(), "download request received");

        let mut blob = match self.ctx.store.get(object_id).await {
            Ok(blob) => blob,
            Err(err) => {
                warn!(object = %object_id, error = %err, "download failed");
                let reason = format!("download of {object_id} failed: {err}");
                reply_error(&self.stream, &envelope, reason).await;
                return Flow::Continue;
            }
        };

        // From here on the stream carries only the object's bytes.
        self.stream.begin_raw_transfer();
        release_registrations(&self.ctx.hub, &self.stream).await;

        match self.stream.send_from(&mut blob).await {
            Ok(sent) => info!(object = %object_id, bytes = sent, "download sent"),
            Err(err) => warn!(object = %object_id, error = %err, "error while sending file"),
        }
        // The object's end is marked by finishing the stream.
        Flow::Finish
    }

    async fn remove(&mut self, envelope: Envelope) -> Flow {
        let object_id = envelope.payload.as_str();
        match self.ctx.store.delete(object_id).await {
            Ok(()) => info!(object = %object_id, "object removed"),
            Err(err) => {
                warn!(object = %object_id, error = %err, "remove failed");
                let reason = format!("remove of {object_id} failed: {err}");
                reply_error(&self.stream, &envelope, reason).await;
            }
        }
        Flow::Continue
    }

    async fn close(self) {
        let stream_id = self.stream.id();
        self.stream.close();
        release_registrations(&self.ctx.hub, &self.stream).await;

        if let Err(err) = self.stream.shutdown().await {
            debug!(stream = %stream_id, error = %err, "stream shutdown failed");
        }
        debug!(stream = %stream_id, "dispatcher finished");
    }
}

/// Drops every registry entry bound to `stream` and tells the channels it
/// left.
async fn release_registrations(hub: &Hub, stream: &StreamHandle) {
    for ChannelUpdate { channel_id, peer_ids } in hub.release_stream(stream.id()).await {
        announce_members(hub, &channel_id, &peer_ids).await;
    }
}

async fn reply_error(stream: &StreamHandle, request: &Envelope, reason: String) {
    let reply = Envelope::error(&request.channel_id, reason);
    if let Err(err) = stream.send(&reply).await {
        debug!(stream = %stream.id(), error = %err, "failed to send error reply");
    }
}

/// Broadcasts the channel's membership as a `user_list` envelope to every peer
/// in it.
pub async fn announce_members(hub: &Hub, channel_id: &str, peer_ids: &[String]) {
    match Envelope::user_list(channel_id, peer_ids) {
        Ok(announcement) => {
            hub.broadcast(channel_id, &announcement, None).await;
        }
        Err(err) => warn!(channel = %channel_id, error = %err, "failed to encode user list"),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io;
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::*;
    use crate::message::write_envelope;
    use crate::store::MemoryBlobStore;

    /// A reader that may move between threads but not be shared by them.
    struct Unshared<R> {
        inner: R,
        _not_sync: PhantomData<Cell<()>>,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for Unshared<R> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn runs_as_a_task_over_readers_that_are_not_sync() {
        let ctx = RelayContext::new(
            Arc::new(Hub::new()),
            Arc::new(MemoryBlobStore::new()),
            DispatchLimits::default(),
        );
        let (server_recv, mut client_send) = tokio::io::duplex(1024);
        let (server_send, client_recv) = tokio::io::duplex(1024);
        let recv = Unshared {
            inner: server_recv,
            _not_sync: PhantomData,
        };
        let task = tokio::spawn(Dispatcher::new(recv, StreamHandle::new(server_send), ctx).run());

        let request = Envelope::new(MessageKind::Remove, "lobby", "missing", "a");
        write_envelope(&mut client_send, &request).await.unwrap();
        let mut replies = EnvelopeReader::new(client_recv);
        let reply = replies.next_envelope().await.unwrap().unwrap();
        assert_eq!(reply.kind(), MessageKind::Error);

        drop(client_send);
        task.await.unwrap();
    }
}
