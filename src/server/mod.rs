//! WebSocket broadcast server
//!
//! One listener per stream. New clients get the handshake header (or the
//! rejection notice while the frame size is unknown); afterwards every chunk
//! of transcoder output is fanned out to all registered clients.

pub mod clients;
pub mod config;
pub mod listener;

pub use clients::{BroadcastOutcome, ClientConnection, ClientLink, ClientSet, ClientState};
pub use config::{ServerConfig, DEFAULT_PORT};
pub use listener::BroadcastServer;
