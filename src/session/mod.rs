//! Stream sessions
//!
//! A session owns one transcoder at a time, re-emits its output as
//! `camdata`, discovers the frame size from its diagnostics and stops the
//! stream when output goes silent for longer than the configured interval.

pub mod probe;
pub mod state;
pub mod stream;

pub use probe::DimensionProbe;
pub use state::{Dimensions, SessionPhase, SessionState, DEFAULT_MAX_SILENCE, MIN_MAX_SILENCE};
pub use stream::{SessionCounters, SessionEvent, StreamSession};
