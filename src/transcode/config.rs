//! Transcoder invocation settings
//!
//! Builds the argument list handed to the external transcoding binary.

/// Default transcoder binary, resolved through `PATH`
pub const DEFAULT_PROGRAM: &str = "ffmpeg";

/// Rate limiting and quality flags for a low-latency preview
const PREVIEW_FLAGS: &[&str] = &[
    "-b:v", "1000k", "-maxrate", "1000k", "-bufsize", "1000k", "-qmin", "16", "-qmax", "51",
    "-an",
];

/// Output sink: write the transcoded stream to stdout
const STDOUT_SINK: &str = "-";

/// Transport used to pull the source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Force interleaved RTSP over TCP
    Tcp,
    /// Leave the transport to the transcoder (UDP for RTSP)
    #[default]
    Udp,
}

/// Immutable description of one transcoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeConfig {
    /// Source URL (e.g. `rtsp://camera/stream1`)
    pub url: String,

    /// Source transport preference
    pub transport: Transport,

    /// Path to the transcoder binary
    pub program: String,

    /// Additional flags in caller order; an empty value means a bare flag
    pub extra_flags: Vec<(String, String)>,
}

impl TranscodeConfig {
    /// Create a config for the given source URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: Transport::default(),
            program: DEFAULT_PROGRAM.to_string(),
            extra_flags: Vec::new(),
        }
    }

    /// Set the source transport
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set the transcoder binary path
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Append an additional flag; pass an empty value for a bare flag
    pub fn flag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_flags.push((name.into(), value.into()));
        self
    }

    /// Build the full argument list
    ///
    /// Order: transport and input, preview flags, caller flags, stdout sink.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(5 + PREVIEW_FLAGS.len() + self.extra_flags.len() * 2);

        if self.transport == Transport::Tcp {
            args.push("-rtsp_transport".to_string());
            args.push("tcp".to_string());
        }
        args.push("-i".to_string());
        args.push(self.url.clone());

        args.extend(PREVIEW_FLAGS.iter().map(|s| s.to_string()));

        for (name, value) in &self.extra_flags {
            args.push(name.clone());
            if !value.is_empty() {
                args.push(value.clone());
            }
        }

        args.push(STDOUT_SINK.to_string());
        args
    }
}
