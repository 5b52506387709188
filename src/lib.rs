//! Relay an RTSP camera into browsers
//!
//! An external transcoder (ffmpeg by default) pulls the source and writes an
//! MPEG-TS byte stream to stdout. The relay re-emits that output chunk by
//! chunk and fans it out to WebSocket clients, after an 8-byte handshake that
//! tells the browser player the frame size.
//!
//! # Architecture
//!
//! ```text
//!  rtsp://camera
//!       │
//!       ▼
//! ┌──────────────┐ data / diagnostic ┌──────────────┐  camdata  ┌─────────────────┐
//! │ ProcessHandle├──────────────────►│ StreamSession├──────────►│ BroadcastServer │
//! │  (ffmpeg)    │  clean/error-exit │  probe,      │           │  ClientSet      │
//! └──────────────┘                   │  watchdog    │           └───┬────┬────┬───┘
//!                                    └──────┬───────┘               ▼    ▼    ▼
//!                                           │ stream-error        browsers (jsmp)
//!                                           ▼
//!                                      StreamRelay owner
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rtsp_relay::{StreamConfig, StreamRelay};
//!
//! # async fn run() -> rtsp_relay::Result<()> {
//! let config = StreamConfig::from_url("rtsp://camera.local/stream1");
//! let (relay, mut errors) = StreamRelay::start(config).await?;
//!
//! while let Some(error) = errors.recv().await {
//!     tracing::warn!(%error, "restarting");
//!     relay.restart().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod transcode;

pub use config::{StreamConfig, DEFAULT_STREAM_NAME};
pub use error::{ClientSendError, Error, Result, StreamError};
pub use registry::{RegistryError, RelayRegistry};
pub use relay::StreamRelay;
pub use server::{BroadcastServer, ClientSet, ServerConfig};
pub use session::{Dimensions, SessionEvent, SessionPhase, StreamSession};
pub use stats::{RegistryStats, RelayStats};
pub use transcode::{ExitOutcome, ProcessEvent, ProcessHandle, TranscodeConfig, Transport};
