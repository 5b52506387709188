//! Session state machine
//!
//! Tracks one stream from start to stop:
//!
//! ```text
//! Stopped ──► Starting ──► Running ──► Stopped
//!                ▲            │
//!                └─ Restarting┘
//! ```

use std::fmt;
use std::time::{Duration, Instant};

/// Default maximum gap between two output chunks
pub const DEFAULT_MAX_SILENCE: Duration = Duration::from_millis(30_000);

/// Smallest accepted silence interval; the watchdog period must be non-zero
pub const MIN_MAX_SILENCE: Duration = Duration::from_millis(1);

/// Video frame size reported by the transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u16,
    pub height: u16,
}

impl Dimensions {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No transcoder running
    Stopped,
    /// Transcoder being spawned
    Starting,
    /// Transcoder running, output relayed
    Running,
    /// Old transcoder being replaced
    Restarting,
}

/// Complete state of one stream session
#[derive(Debug)]
pub struct SessionState {
    /// Display name
    pub name: String,

    /// Source URL
    pub url: String,

    /// Frame size; `None` until discovered from diagnostic text
    pub dimensions: Option<Dimensions>,

    /// When the last output chunk arrived
    pub last_data_at: Instant,

    /// Maximum tolerated gap between output chunks
    pub max_silence: Duration,

    /// Current phase
    pub phase: SessionPhase,

    /// When the current transcoder was started
    pub started_at: Option<Instant>,

    /// Output bytes received from the current transcoder
    pub bytes_received: u64,

    /// Output chunks received from the current transcoder
    pub chunks_received: u64,

    /// Number of restarts performed
    pub restarts: u64,
}

impl SessionState {
    /// Create a stopped session
    ///
    /// `max_silence` is raised to [`MIN_MAX_SILENCE`] if smaller.
    pub fn new(name: impl Into<String>, url: impl Into<String>, max_silence: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            dimensions: None,
            last_data_at: Instant::now(),
            max_silence: max_silence.max(MIN_MAX_SILENCE),
            phase: SessionPhase::Stopped,
            started_at: None,
            bytes_received: 0,
            chunks_received: 0,
            restarts: 0,
        }
    }

    /// Enter `Starting`: forget dimensions and reset the silence clock
    pub fn begin_start(&mut self, now: Instant) {
        self.phase = SessionPhase::Starting;
        self.dimensions = None;
        self.last_data_at = now;
        self.started_at = Some(now);
        self.bytes_received = 0;
        self.chunks_received = 0;
    }

    /// Transcoder spawned
    pub fn mark_running(&mut self) {
        if self.phase == SessionPhase::Starting {
            self.phase = SessionPhase::Running;
        }
    }

    /// Enter `Restarting`
    pub fn begin_restart(&mut self) {
        self.phase = SessionPhase::Restarting;
        self.restarts += 1;
    }

    /// Record an output chunk
    pub fn on_data(&mut self, len: usize, now: Instant) {
        self.last_data_at = now;
        self.bytes_received += len as u64;
        self.chunks_received += 1;
    }

    /// Record the frame size; the first value wins until the next start
    ///
    /// Returns true if the value was accepted.
    pub fn set_dimensions(&mut self, dimensions: Dimensions) -> bool {
        if self.dimensions.is_some() {
            return false;
        }
        self.dimensions = Some(dimensions);
        true
    }

    /// Time since the last output chunk
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_data_at)
    }

    /// Whether the silence interval has been exceeded
    pub fn is_stale(&self, now: Instant) -> bool {
        self.silence(now) >= self.max_silence
    }

    /// Enter `Stopped`; the frame size is forgotten with the transcoder
    pub fn stop(&mut self) {
        self.phase = SessionPhase::Stopped;
        self.dimensions = None;
        self.started_at = None;
    }

    /// Whether a transcoder is running
    pub fn is_running(&self) -> bool {
        self.phase == SessionPhase::Running
    }

    /// Time since the current transcoder was started
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }
}
