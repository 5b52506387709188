//! Transcoder process supervision
//!
//! Spawns the external transcoder and turns its byte streams and exit status
//! into [`ProcessEvent`]s:
//!
//! ```text
//!            ┌──────────────┐ stdout ──► reader task ──► Data(Bytes)
//!  start() ─►│ child process│ stderr ──► reader task ──► Diagnostic(Bytes)
//!            └──────┬───────┘
//!                   └── supervisor task ──► CleanExit | ErrorExit(outcome)
//! ```
//!
//! Each handle owns its own event channel. Dropping or stopping the handle
//! retires that channel, so events from an old process never reach whoever
//! started a new one.

use std::fmt;
use std::process::{ExitStatus, Stdio};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::config::TranscodeConfig;

/// Capacity of the per-process event queue
const EVENT_QUEUE: usize = 256;

/// Read buffer size for the output and diagnostic pipes
const READ_CHUNK: usize = 64 * 1024;

/// Token that asks the transcoder to quit
const QUIT_TOKEN: &[u8] = b"q";

/// How a transcoder process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Exit code 0 without a signal
    pub fn is_clean(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Event produced by a running transcoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Chunk of transcoded output
    Data(Bytes),
    /// Chunk of diagnostic text
    Diagnostic(Bytes),
    /// Process exited with code 0
    CleanExit,
    /// Process exited with a non-zero code or was terminated by a signal
    ErrorExit(ExitOutcome),
}

impl ProcessEvent {
    /// Event tag
    pub fn name(&self) -> &'static str {
        match self {
            ProcessEvent::Data(_) => "data",
            ProcessEvent::Diagnostic(_) => "diagnostic",
            ProcessEvent::CleanExit => "clean-exit",
            ProcessEvent::ErrorExit(_) => "error-exit",
        }
    }

    fn from_exit(outcome: ExitOutcome) -> Self {
        if outcome.is_clean() {
            ProcessEvent::CleanExit
        } else {
            ProcessEvent::ErrorExit(outcome)
        }
    }
}

/// One live transcoder process
///
/// The child is owned by a supervisor task; the handle keeps the means to
/// stop it.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl ProcessHandle {
    /// Spawn the transcoder described by `config`
    ///
    /// Returns the handle together with the receiver of its events.
    pub fn start(config: &TranscodeConfig) -> Result<(Self, mpsc::Receiver<ProcessEvent>)> {
        let args = config.args();

        let mut child = Command::new(&config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: config.program.clone(),
                source,
            })?;

        let pid = child.id();
        tracing::info!(pid = ?pid, program = %config.program, args = ?args, "Transcoder started");

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (stop_tx, stop_rx) = oneshot::channel();

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, event_tx.clone(), ProcessEvent::Data)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, event_tx.clone(), ProcessEvent::Diagnostic)));

        let supervisor = tokio::spawn(supervise(
            child,
            stdin,
            [stdout, stderr],
            stop_rx,
            event_tx,
        ));

        Ok((
            Self {
                pid,
                stop_tx: Some(stop_tx),
                supervisor,
            },
            event_rx,
        ))
    }

    /// OS process id captured at spawn; kept after the process exits
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the transcoder to quit, kill it and wait until it is reaped
    ///
    /// Harmless on a process that already exited.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Err means the supervisor already saw the exit
            let _ = stop_tx.send(());
        }

        if let Err(e) = (&mut self.supervisor).await {
            tracing::warn!(pid = ?self.pid, error = %e, "Transcoder supervisor failed");
        }

        tracing::info!(pid = ?self.pid, "Transcoder stopped and released");
    }
}

/// Forward everything read from `pipe` as events until EOF
async fn pump<R>(mut pipe: R, events: mpsc::Sender<ProcessEvent>, wrap: fn(Bytes) -> ProcessEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        match pipe.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if events.send(wrap(chunk)).await.is_err() {
                    break;
                }
                buf.reserve(READ_CHUNK);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Transcoder pipe read failed");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    stdin: Option<ChildStdin>,
    readers: [Option<JoinHandle<()>>; 2],
    stop_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<ProcessEvent>,
) {
    let pid = child.id();

    let exit = tokio::select! {
        status = child.wait() => Exit::Natural(status),
        // Resolves on an explicit stop or when the handle is dropped
        _ = stop_rx => Exit::Requested,
    };

    match exit {
        Exit::Natural(status) => {
            // Let the readers drain so output precedes the exit event
            for reader in readers.into_iter().flatten() {
                let _ = reader.await;
            }

            let outcome = match status {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => {
                    tracing::error!(pid = ?pid, error = %e, "Failed to wait on transcoder");
                    ExitOutcome::unknown()
                }
            };

            if outcome.is_clean() {
                tracing::info!(pid = ?pid, "Transcoder exited");
            } else {
                tracing::error!(
                    pid = ?pid,
                    code = ?outcome.code,
                    signal = ?outcome.signal,
                    "Transcoder exited with error"
                );
            }

            let _ = events.send(ProcessEvent::from_exit(outcome)).await;
        }
        Exit::Requested => {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(QUIT_TOKEN).await {
                    tracing::debug!(pid = ?pid, error = %e, "Failed to send quit token");
                }
            }

            if let Err(e) = child.kill().await {
                tracing::debug!(pid = ?pid, error = %e, "Failed to kill transcoder");
            }

            for reader in readers.into_iter().flatten() {
                reader.abort();
            }
        }
    }
}

enum Exit {
    Natural(std::io::Result<ExitStatus>),
    Requested,
}
