//! Registered client connections
//!
//! Each client gets a bounded queue drained by its own connection task.
//! Broadcasting never waits on a client: a chunk that cannot be queued
//! immediately is dropped for that client only.
//!
//! ```text
//!                  ┌──► queue ──► connection task ──► client A
//! broadcast(chunk) ├──► queue ──► connection task ──► client B
//!                  └──► (full / closed: skipped, logged)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::ClientSendError;

/// Connection state of a registered client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Ready to receive chunks
    Connected,
    /// Shutdown notice requested, connection closing
    Closing,
    /// Connection task gone
    Closed,
}

/// A registered client
#[derive(Debug)]
pub struct ClientConnection {
    /// Registration id
    pub id: u64,
    /// Remote address
    pub peer_addr: SocketAddr,
    /// When the client was registered
    pub connected_at: Instant,
    frames: mpsc::Sender<Bytes>,
    close: Option<oneshot::Sender<&'static str>>,
}

impl ClientConnection {
    /// Current connection state
    pub fn state(&self) -> ClientState {
        if self.frames.is_closed() {
            ClientState::Closed
        } else if self.close.is_none() {
            ClientState::Closing
        } else {
            ClientState::Connected
        }
    }

    fn try_send(&self, chunk: &Bytes) -> Result<(), ClientSendError> {
        if self.state() != ClientState::Connected {
            return Err(ClientSendError::NotReady(self.peer_addr));
        }

        match self.frames.try_send(chunk.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ClientSendError::QueueFull(self.peer_addr)),
            Err(TrySendError::Closed(_)) => Err(ClientSendError::NotReady(self.peer_addr)),
        }
    }

    fn request_close(&mut self, notice: &'static str) {
        if let Some(close) = self.close.take() {
            // Err means the connection task already ended
            let _ = close.send(notice);
        }
    }
}

/// Receiving side of a registration, owned by the connection task
#[derive(Debug)]
pub struct ClientLink {
    /// Registration id
    pub id: u64,
    /// Chunks to forward to the client
    pub frames: mpsc::Receiver<Bytes>,
    /// Fires with a notice when the server closes the client
    pub close: oneshot::Receiver<&'static str>,
}

/// Result of one broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastOutcome {
    /// Clients the chunk was queued for
    pub sent: usize,
    /// Clients skipped because they were not ready or saturated
    pub skipped: usize,
}

/// Set of registered clients of one stream
#[derive(Debug)]
pub struct ClientSet {
    clients: RwLock<HashMap<u64, ClientConnection>>,
    count: AtomicUsize,
    next_id: AtomicU64,
    queue: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ClientSet {
    /// Create an empty set; each client may queue `queue` chunks
    pub fn new(queue: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            queue: queue.max(1),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Register a client and return its receiving side
    pub async fn register(&self, peer_addr: SocketAddr) -> ClientLink {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::channel(self.queue);
        let (close_tx, close_rx) = oneshot::channel();

        let mut clients = self.clients.write().await;
        clients.insert(
            id,
            ClientConnection {
                id,
                peer_addr,
                connected_at: Instant::now(),
                frames: frames_tx,
                close: Some(close_tx),
            },
        );
        self.count.store(clients.len(), Ordering::Relaxed);

        ClientLink {
            id,
            frames: frames_rx,
            close: close_rx,
        }
    }

    /// Remove a client; false if it was not registered
    pub async fn deregister(&self, id: u64) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(&id).is_some();
        self.count.store(clients.len(), Ordering::Relaxed);
        removed
    }

    /// Queue a chunk for every connected client
    pub async fn broadcast(&self, chunk: Bytes) -> BroadcastOutcome {
        let clients = self.clients.read().await;
        let mut outcome = BroadcastOutcome::default();

        for client in clients.values() {
            match client.try_send(&chunk) {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    outcome.skipped += 1;
                    match e {
                        ClientSendError::NotReady(_) => {
                            tracing::warn!(client_id = client.id, error = %e, "Chunk skipped")
                        }
                        ClientSendError::QueueFull(_) => {
                            tracing::debug!(client_id = client.id, error = %e, "Chunk skipped")
                        }
                    }
                }
            }
        }

        self.frames_sent
            .fetch_add(outcome.sent as u64, Ordering::Relaxed);
        self.frames_dropped
            .fetch_add(outcome.skipped as u64, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add((chunk.len() * outcome.sent) as u64, Ordering::Relaxed);

        outcome
    }

    /// Send `notice` to every client, close them and clear the set
    ///
    /// Returns the number of clients that were registered.
    pub async fn stop_all(&self, notice: &'static str) -> usize {
        let mut clients = self.clients.write().await;
        let closed = clients.len();

        for (_, mut client) in clients.drain() {
            client.request_close(notice);
        }
        self.count.store(0, Ordering::Relaxed);

        if closed > 0 {
            tracing::info!(clients = closed, "Closed all clients");
        }
        closed
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Chunks queued across all clients
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Chunks skipped across all clients
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Bytes queued across all clients
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
