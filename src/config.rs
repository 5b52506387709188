//! Per-stream configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::server::ServerConfig;
use crate::session::{DEFAULT_MAX_SILENCE, MIN_MAX_SILENCE};
use crate::transcode::{TranscodeConfig, Transport};

/// Default display name of a stream
pub const DEFAULT_STREAM_NAME: &str = "stream";

/// Everything needed to relay one source
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Display name used in logs and as registry key
    pub name: String,

    /// Transcoder invocation
    pub transcode: TranscodeConfig,

    /// Broadcast listener settings
    pub server: ServerConfig,

    /// Maximum gap between output chunks before the stream is stopped
    pub max_silence: Duration,
}

impl StreamConfig {
    /// Create a config with default server settings
    pub fn new(name: impl Into<String>, transcode: TranscodeConfig) -> Self {
        Self {
            name: name.into(),
            transcode,
            server: ServerConfig::default(),
            max_silence: DEFAULT_MAX_SILENCE,
        }
    }

    /// Create an unnamed config for a source URL
    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(DEFAULT_STREAM_NAME, TranscodeConfig::new(url))
    }

    /// Set the display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the source transport
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transcode.transport = transport;
        self
    }

    /// Set the listener address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.server.bind_addr = addr;
        self
    }

    /// Replace the server settings
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Set the silence interval (at least 1 ms)
    pub fn max_silence(mut self, max_silence: Duration) -> Self {
        self.max_silence = max_silence.max(MIN_MAX_SILENCE);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::from_url("rtsp://cam/1");

        assert_eq!(config.name, "stream");
        assert_eq!(config.transcode.url, "rtsp://cam/1");
        assert_eq!(config.transcode.transport, Transport::Udp);
        assert_eq!(config.max_silence, Duration::from_millis(30_000));
        assert_eq!(config.server.bind_addr.port(), 9999);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = StreamConfig::from_url("rtsp://cam/1")
            .name("lobby")
            .transport(Transport::Tcp)
            .bind(addr)
            .max_silence(Duration::from_secs(5));

        assert_eq!(config.name, "lobby");
        assert_eq!(config.transcode.transport, Transport::Tcp);
        assert_eq!(config.server.bind_addr, addr);
        assert_eq!(config.max_silence, Duration::from_secs(5));
    }

    #[test]
    fn test_max_silence_floor() {
        let config = StreamConfig::from_url("rtsp://cam/1").max_silence(Duration::ZERO);

        assert_eq!(config.max_silence, Duration::from_millis(1));
    }
}
