//! Stream session actor
//!
//! One task per stream owns the transcoder handle and all session state.
//! Commands, transcoder events and watchdog ticks are multiplexed in a single
//! loop, so nothing here is shared between threads:
//!
//! ```text
//!   StreamSession ──Command──►┐
//!   ProcessHandle ──events───►├─► SessionWorker ──SessionEvent──► owner
//!   watchdog tick ───────────►┘        │
//!                                      └─► watch: phase, dimensions
//! ```
//!
//! Stopping or restarting drops the transcoder's event receiver before the
//! replacement is spawned, so a late exit from an old process can never be
//! mistaken for a failure of the new one.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::config::StreamConfig;
use crate::error::{Error, Result, StreamError};
use crate::transcode::{ProcessEvent, ProcessHandle, TranscodeConfig};

use super::probe::DimensionProbe;
use super::state::{Dimensions, SessionPhase, SessionState};

/// Capacity of the session event queue
const EVENT_QUEUE: usize = 256;

/// Event emitted by a stream session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transcoded output, unchanged
    CamData(Bytes),
    /// The stream failed; the session is stopped
    StreamError(StreamError),
}

impl SessionEvent {
    /// Event tag
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::CamData(_) => "camdata",
            SessionEvent::StreamError(_) => "stream-error",
        }
    }
}

/// Counters of the current session
#[derive(Debug, Clone, Default)]
pub struct SessionCounters {
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub restarts: u64,
    pub uptime: Option<Duration>,
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    Restart(oneshot::Sender<Result<()>>),
    Counters(oneshot::Sender<SessionCounters>),
}

/// Handle to a running session task
#[derive(Debug)]
pub struct StreamSession {
    name: String,
    commands: mpsc::Sender<Command>,
    phase: watch::Receiver<SessionPhase>,
    dimensions: watch::Receiver<Option<Dimensions>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Start(_) => "Start",
            Command::Stop(_) => "Stop",
            Command::Restart(_) => "Restart",
            Command::Counters(_) => "Counters",
        };
        f.write_str(name)
    }
}

impl StreamSession {
    /// Spawn the session task in the `Stopped` phase
    ///
    /// Returns the session and the receiver of its events.
    pub fn spawn(config: &StreamConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Stopped);
        let (dimensions_tx, dimensions_rx) = watch::channel(None);

        let worker = SessionWorker {
            state: SessionState::new(&config.name, &config.transcode.url, config.max_silence),
            transcode: config.transcode.clone(),
            process: None,
            process_events: None,
            watchdog: None,
            probe: DimensionProbe::new(),
            commands: command_rx,
            events: event_tx,
            phase_tx,
            dimensions_tx,
        };

        let task = tokio::spawn(worker.run());

        (
            Self {
                name: config.name.clone(),
                commands: command_tx,
                phase: phase_rx,
                dimensions: dimensions_rx,
                task,
            },
            event_rx,
        )
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the transcoder
    ///
    /// Starting a running session replaces its transcoder.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx)).await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Cancel the watchdog and stop the transcoder; no-op when stopped
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Stop the current transcoder and start a new one
    pub async fn restart(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Restart(tx)).await?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Counters of the current transcoder run
    pub async fn counters(&self) -> Result<SessionCounters> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Counters(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Frame size, `None` while unknown
    pub fn dimensions(&self) -> Option<Dimensions> {
        *self.dimensions.borrow()
    }

    /// Subscribe to phase changes
    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Subscribe to frame size changes
    pub fn watch_dimensions(&self) -> watch::Receiver<Option<Dimensions>> {
        self.dimensions.clone()
    }

    /// Stop the transcoder and end the session task
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            tracing::warn!(stream = %self.name, error = %e, "Session task failed");
        }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::SessionClosed(self.name.clone())
    }
}

enum Step {
    Command(Option<Command>),
    Process(Option<ProcessEvent>),
    Watchdog,
}

struct SessionWorker {
    state: SessionState,
    transcode: TranscodeConfig,
    process: Option<ProcessHandle>,
    process_events: Option<mpsc::Receiver<ProcessEvent>>,
    watchdog: Option<Interval>,
    probe: DimensionProbe,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SessionEvent>,
    phase_tx: watch::Sender<SessionPhase>,
    dimensions_tx: watch::Sender<Option<Dimensions>>,
}

impl SessionWorker {
    async fn run(mut self) {
        tracing::info!(
            stream = %self.state.name,
            url = %self.state.url,
            max_silence_ms = self.state.max_silence.as_millis() as u64,
            "Stream session created"
        );

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                event = next_event(&mut self.process_events) => Step::Process(event),
                _ = next_tick(&mut self.watchdog) => Step::Watchdog,
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => break,
                Step::Process(Some(event)) => self.handle_process_event(event).await,
                Step::Process(None) => {
                    // Event channel closed without an exit event
                    self.process_events = None;
                }
                Step::Watchdog => self.check_watchdog().await,
            }
        }

        self.stop().await;
        tracing::debug!(stream = %self.state.name, "Stream session task ended");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Restart(reply) => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            Command::Counters(reply) => {
                let _ = reply.send(SessionCounters {
                    bytes_received: self.state.bytes_received,
                    chunks_received: self.state.chunks_received,
                    restarts: self.state.restarts,
                    uptime: self.state.uptime(),
                });
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        // Never two live handles for one session
        self.release_process().await;

        let now = Instant::now();
        self.state.begin_start(now);
        self.probe.reset();
        self.publish();

        let (handle, events) = match ProcessHandle::start(&self.transcode) {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(stream = %self.state.name, error = %e, "Failed to start transcoder");
                self.state.stop();
                self.publish();
                return Err(e);
            }
        };

        let pid = handle.pid();
        self.process = Some(handle);
        self.process_events = Some(events);
        self.watchdog = Some(arm_watchdog(self.state.max_silence));

        self.state.mark_running();
        self.publish();

        tracing::info!(stream = %self.state.name, url = %self.state.url, pid = ?pid, "Stream started");
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state.phase == SessionPhase::Stopped
            && self.process.is_none()
            && self.watchdog.is_none()
        {
            return;
        }

        self.watchdog = None;
        self.release_process().await;
        self.state.stop();
        self.publish();

        tracing::info!(stream = %self.state.name, url = %self.state.url, "Stream stopped");
    }

    async fn restart(&mut self) -> Result<()> {
        tracing::info!(stream = %self.state.name, url = %self.state.url, "Restarting stream");

        self.watchdog = None;
        self.state.begin_restart();
        self.publish();
        self.release_process().await;

        self.start().await
    }

    /// Retire the event receiver, then kill and reap the process
    async fn release_process(&mut self) {
        self.process_events = None;
        if let Some(handle) = self.process.take() {
            handle.stop().await;
        }
    }

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Data(chunk) => {
                self.state.on_data(chunk.len(), Instant::now());
                self.emit(SessionEvent::CamData(chunk)).await;
            }
            ProcessEvent::Diagnostic(chunk) => self.handle_diagnostic(&chunk),
            ProcessEvent::CleanExit => {
                tracing::info!(stream = %self.state.name, "Transcoder finished, waiting for the watchdog");

                // The watchdog stays armed: once the silence interval passes
                // it stops the stream and raises the stream error
                self.release_process().await;
                self.state.stop();
                self.publish();
            }
            ProcessEvent::ErrorExit(outcome) => {
                tracing::error!(
                    stream = %self.state.name,
                    code = ?outcome.code,
                    signal = ?outcome.signal,
                    "Transcoder exited with error"
                );
                self.stop().await;
                self.emit(SessionEvent::StreamError(StreamError::ProcessExit(outcome)))
                    .await;
            }
        }
    }

    fn handle_diagnostic(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            tracing::debug!(stream = %self.state.name, "{}", line);
        }

        if let Some(dimensions) = self.probe.feed(&text) {
            if self.state.set_dimensions(dimensions) {
                tracing::info!(
                    stream = %self.state.name,
                    width = dimensions.width,
                    height = dimensions.height,
                    "Stream dimensions discovered"
                );
                self.publish();
            }
        }
    }

    async fn check_watchdog(&mut self) {
        let now = Instant::now();
        if !self.state.is_stale(now) {
            return;
        }

        let silence = self.state.max_silence;
        tracing::error!(
            stream = %self.state.name,
            ms = silence.as_millis() as u64,
            "No stream data received within the silence interval, stopping"
        );

        self.stop().await;
        self.emit(SessionEvent::StreamError(StreamError::StaleData(silence)))
            .await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!(stream = %self.state.name, "Session event dropped, no receiver");
        }
    }

    /// Dimensions go out first, so a phase observer sees matching dimensions
    fn publish(&self) {
        self.dimensions_tx.send_replace(self.state.dimensions);
        self.phase_tx.send_replace(self.state.phase);
    }
}

fn arm_watchdog(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_event(events: &mut Option<mpsc::Receiver<ProcessEvent>>) -> Option<ProcessEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::transcode::process::tests::fake_transcoder;
    use crate::transcode::ExitOutcome;

    fn config(dir: &TempDir, script: &str, max_silence: Duration) -> StreamConfig {
        let program = fake_transcoder(dir, script);
        StreamConfig::new("cam", TranscodeConfig::new("rtsp://cam/1").program(program.to_string_lossy()))
            .max_silence(max_silence)
    }

    async fn start_retrying(session: &StreamSession) -> Result<()> {
        for _ in 0..50 {
            match session.start().await {
                Err(Error::Spawn { source, .. }) if source.raw_os_error() == Some(26) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => return other,
            }
        }
        session.start().await
    }

    async fn next(rx: &mut mpsc::Receiver<SessionEvent>, within: Duration) -> Option<SessionEvent> {
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_stale_stream_stops_once() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "exec sleep 30", Duration::from_millis(100));
        let (session, mut events) = StreamSession::spawn(&config);

        start_retrying(&session).await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Running);

        let event = next(&mut events, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            event,
            SessionEvent::StreamError(StreamError::StaleData(Duration::from_millis(100)))
        );
        assert_eq!(event.name(), "stream-error");
        assert_eq!(session.phase(), SessionPhase::Stopped);

        // Exactly one stream-error
        assert!(next(&mut events, Duration::from_millis(400)).await.is_none());
    }

    #[tokio::test]
    async fn test_camdata_and_dimensions() {
        let dir = TempDir::new().unwrap();
        let config = config(
            &dir,
            "printf 'Input #0 ... 640x480 ... Output #0\\n' >&2\nsleep 0.2\nprintf '\\001\\002\\003'\nexec sleep 30",
            Duration::from_secs(30),
        );
        let (session, mut events) = StreamSession::spawn(&config);
        let mut dimensions = session.watch_dimensions();

        start_retrying(&session).await.unwrap();

        let event = next(&mut events, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, SessionEvent::CamData(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(event.name(), "camdata");

        tokio::time::timeout(Duration::from_secs(5), dimensions.wait_for(|d| d.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.dimensions(), Some(Dimensions::new(640, 480)));

        let counters = session.counters().await.unwrap();
        assert_eq!(counters.bytes_received, 3);

        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_exit_raises_stream_error() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "exit 3", Duration::from_secs(30));
        let (session, mut events) = StreamSession::spawn(&config);

        start_retrying(&session).await.unwrap();

        let event = next(&mut events, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            event,
            SessionEvent::StreamError(StreamError::ProcessExit(ExitOutcome {
                code: Some(3),
                signal: None
            }))
        );
        assert_eq!(session.phase(), SessionPhase::Stopped);
    }

    #[tokio::test]
    async fn test_clean_exit_goes_stale() {
        let dir = TempDir::new().unwrap();
        let config = config(
            &dir,
            "printf 'Input #0 640x480 Output #0\\n' >&2\nsleep 0.2\nexit 0",
            Duration::from_millis(600),
        );
        let (session, mut events) = StreamSession::spawn(&config);
        let mut phase = session.watch_phase();

        start_retrying(&session).await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            phase.wait_for(|p| *p == SessionPhase::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(session.dimensions(), None);

        // The watchdog outlives the process
        let event = next(&mut events, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            event,
            SessionEvent::StreamError(StreamError::StaleData(Duration::from_millis(600)))
        );
        assert!(next(&mut events, Duration::from_millis(800)).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_after_clean_exit_cancels_watchdog() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "exit 0", Duration::from_secs(1));
        let (session, mut events) = StreamSession::spawn(&config);
        let mut phase = session.watch_phase();

        start_retrying(&session).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            phase.wait_for(|p| *p == SessionPhase::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        session.stop().await.unwrap();
        assert!(next(&mut events, Duration::from_millis(1_500)).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_silence_interval_does_not_kill_session() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "exec sleep 30", Duration::from_secs(30));
        config.max_silence = Duration::ZERO;
        let (session, mut events) = StreamSession::spawn(&config);

        start_retrying(&session).await.unwrap();

        let event = next(&mut events, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            event,
            SessionEvent::StreamError(StreamError::StaleData(Duration::from_millis(1)))
        );

        // The session task is still alive and accepts commands
        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert!(session.counters().await.is_ok());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, "exec sleep 30", Duration::from_secs(30));
        let (session, mut events) = StreamSession::spawn(&config);

        start_retrying(&session).await.unwrap();

        session.stop().await.unwrap();
        session.stop().await.unwrap();

        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert!(next(&mut events, Duration::from_millis(300)).await.is_none());
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = TempDir::new().unwrap();
        let config = config(
            &dir,
            "printf 'Input #0 320x240 Output #0\\n' >&2\nexec sleep 30",
            Duration::from_secs(30),
        );
        let (session, mut events) = StreamSession::spawn(&config);

        start_retrying(&session).await.unwrap();
        session.restart().await.unwrap();

        assert_eq!(session.phase(), SessionPhase::Running);
        let counters = session.counters().await.unwrap();
        assert_eq!(counters.restarts, 1);

        // The killed process must not surface as a stream-error
        assert!(next(&mut events, Duration::from_millis(300)).await.is_none());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_rediscovers_dimensions() {
        let dir = TempDir::new().unwrap();
        // First run reports 320x240, every later run 1280x720
        let config = config(
            &dir,
            "if [ -e \"$0.ran\" ]; then\n  printf 'Input #0 1280x720 Output #0\\n' >&2\nelse\n  touch \"$0.ran\"\n  printf 'Input #0 320x240 Output #0\\n' >&2\nfi\nexec sleep 30",
            Duration::from_secs(30),
        );
        let (session, _events) = StreamSession::spawn(&config);
        let mut dimensions = session.watch_dimensions();

        start_retrying(&session).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            dimensions.wait_for(|d| *d == Some(Dimensions::new(320, 240))),
        )
        .await
        .unwrap()
        .unwrap();

        session.restart().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            dimensions.wait_for(|d| *d == Some(Dimensions::new(1280, 720))),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(session.dimensions(), Some(Dimensions::new(1280, 720)));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_error_leaves_session_stopped() {
        let config = StreamConfig::new(
            "cam",
            TranscodeConfig::new("rtsp://cam/1").program("/nonexistent/transcoder"),
        );
        let (session, _events) = StreamSession::spawn(&config);

        let result = session.start().await;
        assert!(matches!(result, Err(Error::Spawn { .. })));
        assert_eq!(session.phase(), SessionPhase::Stopped);
        assert_eq!(session.dimensions(), None);
    }
}
