//! Statistics for relayed streams

use std::time::Duration;

use crate::session::{Dimensions, SessionPhase};

/// Snapshot of one relay
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// Stream name
    pub name: String,
    /// Session phase when the snapshot was taken
    pub phase: SessionPhase,
    /// Frame size, if known
    pub dimensions: Option<Dimensions>,
    /// Connected clients
    pub clients: usize,
    /// Bytes received from the current transcoder
    pub bytes_received: u64,
    /// Chunks received from the current transcoder
    pub chunks_received: u64,
    /// Chunks queued for clients
    pub frames_sent: u64,
    /// Chunks skipped for clients that were not ready
    pub frames_dropped: u64,
    /// Bytes queued for clients
    pub bytes_sent: u64,
    /// Number of restarts
    pub restarts: u64,
    /// Time since the current transcoder was started
    pub uptime: Option<Duration>,
}

impl RelayStats {
    /// Create an empty snapshot for a stopped stream
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: SessionPhase::Stopped,
            dimensions: None,
            clients: 0,
            bytes_received: 0,
            chunks_received: 0,
            frames_sent: 0,
            frames_dropped: 0,
            bytes_sent: 0,
            restarts: 0,
            uptime: None,
        }
    }

    /// Calculate inbound bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.uptime.map(|d| d.as_secs()).unwrap_or(0);
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }

    /// Fraction of client sends that were dropped
    pub fn drop_ratio(&self) -> f64 {
        let total = self.frames_sent + self.frames_dropped;
        if total > 0 {
            self.frames_dropped as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Process-wide totals over all relays
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Registered relays
    pub streams: usize,
    /// Relays with a running transcoder
    pub running: usize,
    /// Connected clients over all relays
    pub clients: usize,
    /// Bytes received over all relays
    pub bytes_received: u64,
    /// Bytes queued for clients over all relays
    pub bytes_sent: u64,
}

impl RegistryStats {
    /// Sum up relay snapshots
    pub fn from_relays<'a>(relays: impl IntoIterator<Item = &'a RelayStats>) -> Self {
        relays.into_iter().fold(Self::default(), |mut total, relay| {
            total.streams += 1;
            if relay.phase == SessionPhase::Running {
                total.running += 1;
            }
            total.clients += relay.clients;
            total.bytes_received += relay.bytes_received;
            total.bytes_sent += relay.bytes_sent;
            total
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_stats_new() {
        let stats = RelayStats::new("cam");
        assert_eq!(stats.name, "cam");
        assert_eq!(stats.phase, SessionPhase::Stopped);
        assert!(stats.dimensions.is_none());
        assert_eq!(stats.clients, 0);
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.restarts, 0);
        assert!(stats.uptime.is_none());
    }

    #[test]
    fn test_bitrate() {
        let mut stats = RelayStats::new("cam");
        stats.bytes_received = 1_000_000; // 1 MB
        stats.uptime = Some(Duration::from_secs(10));

        // 1,000,000 bytes * 8 bits / 10 seconds = 800,000 bps
        assert_eq!(stats.bitrate(), 800_000);
    }

    #[test]
    fn test_bitrate_zero_duration() {
        let mut stats = RelayStats::new("cam");
        stats.bytes_received = 1_000_000;

        assert_eq!(stats.bitrate(), 0);

        stats.uptime = Some(Duration::from_millis(500));
        assert_eq!(stats.bitrate(), 0);
    }

    #[test]
    fn test_drop_ratio() {
        let mut stats = RelayStats::new("cam");
        assert_eq!(stats.drop_ratio(), 0.0);

        stats.frames_sent = 3;
        stats.frames_dropped = 1;
        assert_eq!(stats.drop_ratio(), 0.25);
    }

    #[test]
    fn test_registry_totals() {
        let mut a = RelayStats::new("a");
        a.phase = SessionPhase::Running;
        a.clients = 2;
        a.bytes_received = 100;
        a.bytes_sent = 200;

        let mut b = RelayStats::new("b");
        b.clients = 1;
        b.bytes_received = 50;

        let total = RegistryStats::from_relays([&a, &b]);
        assert_eq!(total.streams, 2);
        assert_eq!(total.running, 1);
        assert_eq!(total.clients, 3);
        assert_eq!(total.bytes_received, 150);
        assert_eq!(total.bytes_sent, 200);
    }
}
