//! Error types
//!
//! Spawn and bind failures are returned to the caller. Everything that goes
//! wrong while a stream is running is reported as a [`StreamError`] event or
//! isolated per client as a [`ClientSendError`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::registry::RegistryError;
use crate::transcode::ExitOutcome;

/// Result alias for fallible crate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned directly to callers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transcoder binary could not be started
    #[error("failed to spawn transcoder `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The broadcast listener could not bind
    #[error("failed to bind broadcast listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The session task is gone
    #[error("session `{0}` is no longer running")]
    SessionClosed(String),

    /// Relay registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a running stream, delivered as a `stream-error` event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The transcoder terminated with a non-zero code or a signal
    #[error("transcoder exited abnormally ({0})")]
    ProcessExit(ExitOutcome),

    /// No output arrived within the silence interval
    #[error("no stream data received for {} ms", .0.as_millis())]
    StaleData(Duration),
}

/// Failure to hand a chunk to one client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientSendError {
    /// The connection is closing or closed
    #[error("client {0} not connected")]
    NotReady(SocketAddr),

    /// The client's send queue is full
    #[error("client {0} send queue full")]
    QueueFull(SocketAddr),
}
