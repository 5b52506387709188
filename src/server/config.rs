//! Broadcast server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 9999;

/// Broadcast listener settings of one stream
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: SocketAddr,

    /// Clients served at once; excess connections are dropped at accept (0 = unlimited)
    pub max_connections: usize,

    /// Chunks queued per client before new chunks are dropped for it
    pub client_queue: usize,

    /// Set TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,

    /// WebSocket upgrade must complete within this time
    pub connection_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: 0,
            client_queue: 64,
            tcp_nodelay: true,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Default settings listening on `addr`
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the listen address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Limit concurrent clients
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-client queue length (at least 1)
    pub fn client_queue(mut self, chunks: usize) -> Self {
        self.client_queue = chunks.max(1);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set the upgrade timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}
