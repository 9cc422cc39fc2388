//! WebSocket chat relay: a hub that rebroadcasts every message to all
//! connected clients, and a client that survives dropped connections.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for hub and client modes.
//! - [`config`] holds the plain settings both sides run with.
//! - [`message`] defines the JSON wire format and payload normalization.
//! - [`hub`] keeps the set of open connections and fans messages out,
//!   without knowing anything about sockets.
//! - [`server`] binds a hub to an axum WebSocket endpoint and runs the
//!   heartbeat.
//! - [`client`] reconnects with exponential backoff and drives the
//!   terminal UI.
//!
//! Unit tests exercise the hub and the reconnect state machine directly;
//! integration tests run real servers on ephemeral ports.

pub mod cli;
pub mod client;
pub mod config;
pub mod hub;
pub mod message;
pub mod server;
