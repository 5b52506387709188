//! Relay statistics

pub mod metrics;

pub use metrics::{RegistryStats, RelayStats};
