//! Message envelopes and the JSON stream framing used on every relay stream.
//!
//! Peers write envelopes back to back. Browser clients send bare
//! `JSON.stringify` output with no delimiter, other clients terminate each
//! envelope with a newline, so the decoder accepts both. The server always
//! appends `\n` when it writes.

use std::io;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sender id stamped on every envelope the relay itself originates.
pub const SERVER_SENDER_ID: &str = "Server";

/// Default upper bound for one encoded envelope.
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 8 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// The operation an envelope asks for.
///
/// Peers may send any type string; anything not listed here is relayed like a
/// [`MessageKind::Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Join,
    Leave,
    Message,
    Heartbeat,
    Upload,
    Download,
    Remove,
    UserList,
    Error,
}

impl MessageKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "join" => MessageKind::Join,
            "leave" => MessageKind::Leave,
            "message" => MessageKind::Message,
            "heartbeat" => MessageKind::Heartbeat,
            "upload" => MessageKind::Upload,
            "download" => MessageKind::Download,
            "remove" => MessageKind::Remove,
            "user_list" => MessageKind::UserList,
            "error" => MessageKind::Error,
            _ => MessageKind::Message,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Message => "message",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Upload => "upload",
            MessageKind::Download => "download",
            MessageKind::Remove => "remove",
            MessageKind::UserList => "user_list",
            MessageKind::Error => "error",
        }
    }
}

/// One protocol message as it appears on the wire.
///
/// The raw `type` string is kept so relayed envelopes go out exactly as they
/// came in; [`Envelope::kind`] gives the dispatch view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub sender_id: String,
}

impl Envelope {
    pub fn new(
        kind: MessageKind,
        channel_id: impl Into<String>,
        payload: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            message_type: kind.as_str().to_string(),
            channel_id: channel_id.into(),
            payload: payload.into(),
            sender_id: sender_id.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.message_type)
    }

    /// Server announcement of a channel's current membership.
    pub fn user_list(channel_id: &str, peer_ids: &[String]) -> serde_json::Result<Self> {
        let payload = serde_json::to_string(peer_ids)?;
        Ok(Self::new(
            MessageKind::UserList,
            channel_id,
            payload,
            SERVER_SENDER_ID,
        ))
    }

    /// Server reply describing why a request on this stream failed.
    pub fn error(channel_id: &str, reason: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, channel_id, reason, SERVER_SENDER_ID)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("stream read failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope exceeds {0} bytes")]
    EnvelopeTooLarge(usize),
    #[error("stream ended in the middle of an envelope")]
    Truncated,
}

/// Incremental decoder for a stream of concatenated JSON envelopes.
///
/// Bytes read past the end of an envelope stay buffered, which is what lets an
/// upload body that immediately follows its envelope be recovered intact.
pub struct EnvelopeReader<R> {
    inner: R,
    buf: BytesMut,
    max_envelope_bytes: usize,
    eof: bool,
    frame: FrameScan,
}

/// Finds where one JSON value ends without re-reading bytes already scanned.
///
/// Only tracks nesting depth and string state; the bytes it delimits are then
/// handed to serde in one pass.
#[derive(Debug, Default)]
struct FrameScan {
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScan {
    fn in_progress(&self) -> bool {
        self.offset > 0
    }

    /// Resumes scanning `buf` and returns the length of the first complete
    /// value, resetting for the next one.
    fn scan(&mut self, buf: &[u8]) -> Option<usize> {
        for (index, &byte) in buf.iter().enumerate().skip(self.offset) {
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        *self = Self::default();
                        return Some(index + 1);
                    }
                }
                _ => {}
            }
        }
        self.offset = buf.len();
        None
    }
}

impl<R> EnvelopeReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, DEFAULT_MAX_ENVELOPE_BYTES)
    }

    pub fn with_limit(inner: R, max_envelope_bytes: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_envelope_bytes,
            eof: false,
            frame: FrameScan::default(),
        }
    }

    /// Decodes the next envelope, or `None` once the stream has ended cleanly.
    ///
    /// Cancel safe: bytes already read stay in the internal buffer.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, DecodeError> {
        loop {
            if !self.frame.in_progress() {
                self.skip_whitespace();
            }

            if let Some(&first) = self.buf.first() {
                if !matches!(first, b'{' | b'[') {
                    return Err(DecodeError::Json(serde::de::Error::custom(format!(
                        "unexpected byte {:?} at start of envelope",
                        first as char
                    ))));
                }

                if let Some(end) = self.frame.scan(&self.buf) {
                    let envelope = serde_json::from_slice(&self.buf[..end]);
                    self.buf.advance(end);
                    return Ok(Some(envelope?));
                }

                if self.buf.len() > self.max_envelope_bytes {
                    return Err(DecodeError::EnvelopeTooLarge(self.max_envelope_bytes));
                }
            }

            if self.eof {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(DecodeError::Truncated)
                };
            }

            self.fill().await?;
        }
    }

    /// Reads the raw body that follows the last decoded envelope, up to the end
    /// of the stream.
    ///
    /// A single `\n` right after the envelope is a separator, not body. Fails
    /// with `InvalidData` once more than `limit` bytes arrive. Afterwards the
    /// reader reports end-of-stream.
    pub async fn read_body(&mut self, limit: u64) -> io::Result<Vec<u8>> {
        if self.buf.is_empty() && !self.eof {
            self.fill().await?;
        }
        if self.buf.first() == Some(&b'\n') {
            self.buf.advance(1);
        }

        let buffered = self.buf.split().freeze();
        let mut body = Vec::with_capacity(buffered.len());
        let mut source = AsyncReadExt::chain(io::Cursor::new(buffered), &mut self.inner)
            .take(limit.saturating_add(1));
        source.read_to_end(&mut body).await?;
        self.eof = true;

        if body.len() as u64 > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body exceeds {limit} bytes"),
            ));
        }
        Ok(body)
    }

    fn skip_whitespace(&mut self) {
        let leading = self
            .buf
            .iter()
            .take_while(|byte| byte.is_ascii_whitespace())
            .count();
        self.buf.advance(leading);
    }

    async fn fill(&mut self) -> io::Result<()> {
        self.buf.reserve(READ_CHUNK);
        let read = self.inner.read_buf(&mut self.buf).await?;
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

/// Encodes one envelope followed by a newline and flushes it.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut encoded = serde_json::to_vec(envelope).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
