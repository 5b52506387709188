//! One relayed source
//!
//! A [`StreamRelay`] ties a [`StreamSession`] to its [`BroadcastServer`]:
//!
//! ```text
//! StreamSession ──camdata──► pump task ──broadcast──► ClientSet ──► clients
//!       │                        │
//!       └──stream-error──────────┴──► stop_all (stale) ──► owner
//! ```
//!
//! The relay never restarts a failed stream on its own. Stream errors are
//! handed to the owner, which decides whether to call [`StreamRelay::restart`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::protocol::SHUTDOWN_NOTICE;
use crate::server::{BroadcastServer, ClientSet};
use crate::session::{Dimensions, SessionEvent, SessionPhase, StreamSession};
use crate::stats::RelayStats;

/// Capacity of the stream error queue handed to the owner
const ERROR_QUEUE: usize = 16;

/// A running source with its broadcast server
#[derive(Debug)]
pub struct StreamRelay {
    name: String,
    session: StreamSession,
    clients: Arc<ClientSet>,
    local_addr: SocketAddr,
    server_stop: oneshot::Sender<()>,
    server_task: JoinHandle<()>,
    pump_task: JoinHandle<()>,
}

impl StreamRelay {
    /// Bind the broadcast server and start the transcoder
    ///
    /// Returns the relay and the receiver of its stream errors. Bind and
    /// spawn failures are returned here; nothing is left running on error.
    pub async fn start(config: StreamConfig) -> Result<(Self, mpsc::Receiver<StreamError>)> {
        let (session, events) = StreamSession::spawn(&config);
        let clients = Arc::new(ClientSet::new(config.server.client_queue));

        let server = match BroadcastServer::listen(
            &config.name,
            config.server.clone(),
            Arc::clone(&clients),
            session.watch_dimensions(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                session.shutdown().await;
                return Err(e);
            }
        };
        let local_addr = server.local_addr();

        // Dropping the relay without shutdown also ends the accept loop
        let (server_stop, stop_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.run_until(async move {
            let _ = stop_rx.await;
        }));

        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE);
        let pump_task = tokio::spawn(pump(
            config.name.clone(),
            events,
            Arc::clone(&clients),
            errors_tx,
        ));

        let relay = Self {
            name: config.name,
            session,
            clients,
            local_addr,
            server_stop,
            server_task,
            pump_task,
        };

        if let Err(e) = relay.session.start().await {
            relay.shutdown().await;
            return Err(e);
        }

        Ok((relay, errors_rx))
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the broadcast server
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close every client with the shutdown notice and stop the transcoder
    ///
    /// The broadcast server keeps accepting; new clients are rejected until
    /// the stream is started again and reports its frame size.
    pub async fn stop(&self) -> Result<()> {
        self.clients.stop_all(SHUTDOWN_NOTICE).await;
        self.session.stop().await
    }

    /// Replace the transcoder; connected clients stay connected
    pub async fn restart(&self) -> Result<()> {
        self.session.restart().await
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.client_count()
    }

    /// Current session phase
    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    /// Frame size, `None` while unknown
    pub fn dimensions(&self) -> Option<Dimensions> {
        self.session.dimensions()
    }

    /// Subscribe to frame size changes
    pub fn watch_dimensions(&self) -> watch::Receiver<Option<Dimensions>> {
        self.session.watch_dimensions()
    }

    /// Subscribe to phase changes
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.session.watch_phase()
    }

    /// Snapshot of the relay counters
    pub async fn stats(&self) -> Result<RelayStats> {
        let counters = self.session.counters().await?;

        Ok(RelayStats {
            name: self.name.clone(),
            phase: self.session.phase(),
            dimensions: self.session.dimensions(),
            clients: self.clients.client_count(),
            bytes_received: counters.bytes_received,
            chunks_received: counters.chunks_received,
            frames_sent: self.clients.frames_sent(),
            frames_dropped: self.clients.frames_dropped(),
            bytes_sent: self.clients.bytes_sent(),
            restarts: counters.restarts,
            uptime: counters.uptime,
        })
    }

    /// Close all clients, stop the transcoder and the listener
    pub async fn shutdown(self) {
        self.clients.stop_all(SHUTDOWN_NOTICE).await;
        self.session.shutdown().await;

        let _ = self.server_stop.send(());
        if let Err(e) = self.server_task.await {
            tracing::warn!(stream = %self.name, error = %e, "Broadcast server task failed");
        }

        // The session task is gone, so its event queue is closed
        if let Err(e) = self.pump_task.await {
            tracing::warn!(stream = %self.name, error = %e, "Relay pump task failed");
        }

        tracing::info!(stream = %self.name, "Relay shut down");
    }
}

/// Forward session events to clients and owner
async fn pump(
    name: String,
    mut events: mpsc::Receiver<SessionEvent>,
    clients: Arc<ClientSet>,
    errors: mpsc::Sender<StreamError>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::CamData(chunk) => {
                clients.broadcast(chunk).await;
            }
            SessionEvent::StreamError(error) => {
                tracing::warn!(stream = %name, error = %error, "Stream error");

                if matches!(error, StreamError::StaleData(_)) {
                    clients.stop_all(SHUTDOWN_NOTICE).await;
                }

                if errors.try_send(error).is_err() {
                    tracing::debug!(stream = %name, "Stream error not delivered, owner not listening");
                }
            }
        }
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::error::Error;
    use crate::transcode::process::tests::fake_transcoder;
    use crate::transcode::TranscodeConfig;

    async fn start_retrying(config: StreamConfig) -> (StreamRelay, mpsc::Receiver<StreamError>) {
        for _ in 0..50 {
            match StreamRelay::start(config.clone()).await {
                Err(Error::Spawn { source, .. }) if source.raw_os_error() == Some(26) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => return other.unwrap(),
            }
        }
        StreamRelay::start(config).await.unwrap()
    }

    fn script_config(dir: &TempDir, body: &str) -> StreamConfig {
        let script = fake_transcoder(dir, body);
        StreamConfig::new(
            "test",
            TranscodeConfig::new("rtsp://cam/1").program(script.to_string_lossy()),
        )
        .bind("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn test_stats_count_relayed_bytes() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "printf 'abcd'\nexec sleep 30");

        let (relay, _errors) = start_retrying(config).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = relay.stats().await.unwrap();
                if stats.bytes_received == 4 {
                    break stats;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let stats = relay.stats().await.unwrap();
        assert_eq!(stats.name, "test");
        assert_eq!(stats.phase, SessionPhase::Running);
        assert_eq!(stats.clients, 0);
        assert_eq!(stats.restarts, 0);
        assert!(stats.uptime.is_some());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "exec sleep 30");

        let (relay, _errors) = start_retrying(config).await;
        assert_eq!(relay.phase(), SessionPhase::Running);

        relay.stop().await.unwrap();
        assert_eq!(relay.phase(), SessionPhase::Stopped);
        relay.stop().await.unwrap();

        relay.restart().await.unwrap();
        assert_eq!(relay.phase(), SessionPhase::Running);
        assert_eq!(relay.stats().await.unwrap().restarts, 1);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_rejected_after_stop() {
        use futures_util::StreamExt;
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        use crate::protocol::REJECT_NOTICE;

        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "printf 'Input #0 640x480 Output #0\\n' >&2\nexec sleep 30");

        let (relay, _errors) = start_retrying(config).await;
        let mut dimensions = relay.watch_dimensions();
        tokio::time::timeout(Duration::from_secs(5), dimensions.wait_for(|d| d.is_some()))
            .await
            .unwrap()
            .unwrap();

        relay.stop().await.unwrap();
        assert_eq!(relay.dimensions(), None);

        let (mut ws, _) = connect_async(format!("ws://{}", relay.local_addr()))
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first, Message::text(REJECT_NOTICE));
        assert_eq!(relay.client_count(), 0);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_exit_reaches_owner() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "exit 3");

        let (relay, mut errors) = start_retrying(config).await;

        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, StreamError::ProcessExit(outcome) if outcome.code == Some(3)));

        relay.shutdown().await;
    }
}
