//! External transcoder management
//!
//! The transcoder is a separate OS process that pulls the source stream and
//! writes a browser-playable byte stream to stdout. This module builds its
//! command line ([`TranscodeConfig`]) and supervises it ([`ProcessHandle`]).

pub mod config;
pub mod process;

pub use config::{TranscodeConfig, Transport, DEFAULT_PROGRAM};
pub use process::{ExitOutcome, ProcessEvent, ProcessHandle};
