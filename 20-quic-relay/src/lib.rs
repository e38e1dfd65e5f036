//! Real-time relay over QUIC.
//!
//! Peers open bidirectional streams on a QUIC session, join named channels,
//! and exchange JSON envelopes that the server fans out to everyone else in
//! the channel. Streams can also upload, download, and delete stored objects.
//!
//! - [`cli`] parses the command line; [`config`] validates it into a
//!   [`config::RelayConfig`].
//! - [`server`] owns the QUIC endpoint and wires sessions to the hub.
//! - [`session`] accepts the streams of one session and runs a dispatcher per
//!   stream with bounded concurrency.
//! - [`dispatcher`] is the per-stream protocol state machine.
//! - [`hub`] is the shared channel-to-peers registry and broadcast fan-out.
//! - [`sweeper`] periodically evicts peers that stopped sending.
//! - [`message`] defines envelopes and the stream codec.
//! - [`store`] is the object storage interface with memory and directory
//!   backends.
//! - [`transport`] abstracts sessions so the relay can run over QUIC or
//!   in-process pipes.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod hub;
pub mod message;
pub mod server;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod transport;
