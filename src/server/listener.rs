//! Broadcast server listener
//!
//! Handles the WebSocket accept loop and spawns one task per client. A task
//! sends the handshake header, registers the client and then forwards queued
//! chunks until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};
use crate::protocol::{encode_header, REJECT_NOTICE};
use crate::server::clients::ClientSet;
use crate::server::config::ServerConfig;
use crate::session::Dimensions;

/// WebSocket fan-out server of one stream
pub struct BroadcastServer {
    name: String,
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    clients: Arc<ClientSet>,
    dimensions: watch::Receiver<Option<Dimensions>>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl BroadcastServer {
    /// Bind the listener
    ///
    /// `dimensions` decides whether a new client gets the handshake or is
    /// rejected.
    pub async fn listen(
        name: impl Into<String>,
        config: ServerConfig,
        clients: Arc<ClientSet>,
        dimensions: watch::Receiver<Option<Dimensions>>,
    ) -> Result<Self> {
        let name = name.into();
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(stream = %name, addr = %local_addr, "Broadcast server listening");

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            name,
            config,
            listener,
            local_addr,
            clients,
            dimensions,
            connection_semaphore,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!(stream = %self.name, "Broadcast server shutting down");
            }
            _ = self.accept_loop() => {}
        }
    }

    async fn accept_loop(&self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(stream = %self.name, error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(stream = %self.name, peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(peer = %peer_addr, error = %e, "Failed to configure socket");
                return;
            }
        }

        let name = self.name.clone();
        let clients = Arc::clone(&self.clients);
        let dimensions = self.dimensions.clone();
        let upgrade_timeout = self.config.connection_timeout;

        tokio::spawn(async move {
            let _permit = permit;

            let upgrade = tokio_tungstenite::accept_async(socket);
            let ws = match tokio::time::timeout(upgrade_timeout, upgrade).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    tracing::debug!(stream = %name, peer = %peer_addr, error = %e, "WebSocket handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(
                        stream = %name,
                        peer = %peer_addr,
                        timeout_ms = upgrade_timeout.as_millis() as u64,
                        "WebSocket handshake timed out"
                    );
                    return;
                }
            };

            // Copy out so the watch lock is not held across awaits
            let current = *dimensions.borrow();
            match current {
                Some(dimensions) => serve_client(ws, peer_addr, dimensions, &name, &clients).await,
                None => reject_client(ws, peer_addr, &name).await,
            }
        });
    }
}

/// Tell the client the stream is not ready and hang up
async fn reject_client(mut ws: WebSocketStream<TcpStream>, peer_addr: SocketAddr, name: &str) {
    tracing::info!(stream = %name, peer = %peer_addr, "Client rejected: stream dimensions unknown");

    if ws.send(Message::text(REJECT_NOTICE)).await.is_ok() {
        let _ = ws.close(None).await;
    }
}

async fn serve_client(
    ws: WebSocketStream<TcpStream>,
    peer_addr: SocketAddr,
    dimensions: Dimensions,
    name: &str,
    clients: &ClientSet,
) {
    let (mut sink, mut stream) = ws.split();

    // Handshake goes out before registration, so it precedes every chunk
    if let Err(e) = sink.send(Message::binary(encode_header(dimensions))).await {
        tracing::debug!(stream = %name, peer = %peer_addr, error = %e, "Failed to send handshake");
        return;
    }

    let mut link = clients.register(peer_addr).await;
    tracing::info!(
        stream = %name,
        peer = %peer_addr,
        total = clients.client_count(),
        "New WebSocket connection"
    );

    let reason = loop {
        tokio::select! {
            // The close request drops the queue sender, so it must win
            biased;

            notice = &mut link.close => {
                if let Ok(notice) = notice {
                    let _ = sink.send(Message::text(notice)).await;
                }
                let _ = sink.close().await;
                break "closed by server".to_string();
            }
            chunk = link.frames.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.send(Message::binary(chunk)).await {
                        break format!("send failed: {}", e);
                    }
                }
                None => break "deregistered".to_string(),
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => format!("closed by client (code: {}, reason: {})", u16::from(frame.code), frame.reason),
                        None => "closed by client".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("receive failed: {}", e),
                None => break "connection lost".to_string(),
            },
        }
    };

    clients.deregister(link.id).await;
    tracing::info!(
        stream = %name,
        peer = %peer_addr,
        reason = %reason,
        total = clients.client_count(),
        "WebSocket disconnected"
    );
}
