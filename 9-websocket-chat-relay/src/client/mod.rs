//! Client side of the relay.
//!
//! [`reconnect`] is the pure backoff state machine, [`session`] runs it over a
//! real WebSocket, and [`terminal`] puts a stdin/stdout face on top.

pub mod reconnect;
pub mod session;
pub mod terminal;

pub use reconnect::{ConnectionState, ReconnectState, Transition};
pub use session::{
    ClientConfig, ClientEvent, ClientHandle, ConnectionStatus, ResilientClient, SendError,
};
pub use terminal::run;
