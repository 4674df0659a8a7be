//! Unix-socket transport layer for CSI messages.
//!
//! This module provides [`CsiClient`](client::CsiClient) and
//! [`CsiServer`](server::CsiServer), which exchange JSON-encoded
//! [`CsiMessage`](crate::CsiMessage) values over a unix domain socket.  Each
//! connection carries one request; the client half-closes its write side
//! after sending and the server answers before closing.

pub mod client;
pub mod server;

/// Upper bound on the size of a single encoded message.
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;
