//! Relay registry implementation

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};

use super::error::RegistryError;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::relay::StreamRelay;
use crate::stats::{RegistryStats, RelayStats};

/// Registry of running relays, keyed by stream name
///
/// Thread-safe via `RwLock`. Lookups and lifecycle calls on a single relay
/// only take the read lock.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    relays: RwLock<HashMap<String, StreamRelay>>,
}

impl RelayRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a relay and register it under its stream name
    ///
    /// Returns the receiver of the relay's stream errors.
    pub async fn start(&self, config: StreamConfig) -> Result<mpsc::Receiver<StreamError>> {
        let mut relays = self.relays.write().await;

        if relays.contains_key(&config.name) {
            return Err(RegistryError::StreamAlreadyExists(config.name).into());
        }

        let name = config.name.clone();
        let (relay, errors) = StreamRelay::start(config).await?;
        relays.insert(name.clone(), relay);

        tracing::info!(stream = %name, streams = relays.len(), "Relay registered");
        Ok(errors)
    }

    /// Stop a relay's transcoder and close its clients; it stays registered
    pub async fn stop(&self, name: &str) -> Result<()> {
        let relays = self.relays.read().await;
        relay(&relays, name)?.stop().await
    }

    /// Restart a relay's transcoder
    pub async fn restart(&self, name: &str) -> Result<()> {
        let relays = self.relays.read().await;
        relay(&relays, name)?.restart().await
    }

    /// Shut a relay down and unregister it
    pub async fn remove(&self, name: &str) -> Result<()> {
        let removed = self.relays.write().await.remove(name);

        match removed {
            Some(relay) => {
                relay.shutdown().await;
                tracing::info!(stream = %name, "Relay removed");
                Ok(())
            }
            None => Err(RegistryError::StreamNotFound(name.to_string()).into()),
        }
    }

    /// Whether a relay is registered under `name`
    pub async fn contains(&self, name: &str) -> bool {
        self.relays.read().await.contains_key(name)
    }

    /// Connected clients of one relay
    pub async fn client_count(&self, name: &str) -> Result<usize> {
        let relays = self.relays.read().await;
        Ok(relay(&relays, name)?.client_count())
    }

    /// Registered stream names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.relays.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get total number of relays
    pub async fn stream_count(&self) -> usize {
        self.relays.read().await.len()
    }

    /// Statistics of one relay
    pub async fn stats(&self, name: &str) -> Result<RelayStats> {
        let relays = self.relays.read().await;
        relay(&relays, name)?.stats().await
    }

    /// Totals over all relays
    ///
    /// Relays whose session task is gone are left out.
    pub async fn totals(&self) -> RegistryStats {
        let relays = self.relays.read().await;

        let mut snapshots = Vec::with_capacity(relays.len());
        for relay in relays.values() {
            match relay.stats().await {
                Ok(stats) => snapshots.push(stats),
                Err(e) => tracing::warn!(stream = %relay.name(), error = %e, "Stats unavailable"),
            }
        }

        RegistryStats::from_relays(&snapshots)
    }

    /// Shut down and unregister every relay
    pub async fn shutdown_all(&self) {
        let drained: Vec<StreamRelay> = {
            let mut relays = self.relays.write().await;
            relays.drain().map(|(_, relay)| relay).collect()
        };

        for relay in drained {
            relay.shutdown().await;
        }
    }
}

fn relay<'a>(relays: &'a HashMap<String, StreamRelay>, name: &str) -> Result<&'a StreamRelay> {
    relays
        .get(name)
        .ok_or_else(|| RegistryError::StreamNotFound(name.to_string()).into())
}
