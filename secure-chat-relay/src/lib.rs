//! Encrypted multi-client chat relay.
//!
//! Clients bootstrap a per-connection AES-256-GCM key through a fixed
//! handshake that transports the key sealed to the server's X25519 public
//! key. After that every frame in either direction is encrypted, and text
//! messages are relayed to all connected clients.
//!
//! - [`listener`] accepts TCP connections, runs the handshake and starts a
//!   task per authenticated session; it shuts down on a caller-supplied future.
//! - [`handshake`] is the server half of the key exchange.
//! - [`session`] owns one connection after the handshake: receive loop,
//!   dispatch and teardown, plus the shared write handle.
//! - [`registry`] is the locked set of sessions and the broadcast fan-out.
//! - [`crypto`] provides key transport and the frame ciphers.
//! - [`credential`] holds the server secret and certificate and the ways to load them.
//! - [`message`] defines the chat message codec and the length-delimited framing.
//! - [`client`] is the client half of the protocol.
//! - [`cli`] and [`config`] resolve the process configuration.

pub mod cli;
pub mod client;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod message;
pub mod registry;
pub mod session;
