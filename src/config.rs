//! Broker and client configuration
//!
//! Both configs deserialize from JSON with every field optional; missing
//! fields take the defaults below.

use crate::error::{Result, SwitchyardError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default broker endpoint
pub const DEFAULT_BROKER_ENDPOINT: &str = "tcp://127.0.0.1:5550";

/// Default payload capacity of shared-memory channels (4 MiB)
pub const DEFAULT_SHM_CAPACITY: usize = 4 * 1024 * 1024;

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|source| SwitchyardError::ConfigRead {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// ZeroMQ endpoint the ROUTER socket binds to
    pub endpoint: String,
    /// Z85 key pair; a fresh pair is generated when either is empty
    pub public_key: String,
    pub secret_key: String,
    /// Ready channels silent for longer than this are closed
    pub heartbeat_timeout_ms: u64,
    /// Pending channels never heartbeated within this long are dropped
    pub pending_timeout_ms: u64,
    /// Poll granularity of the run loop
    pub tick_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_BROKER_ENDPOINT.to_string(),
            public_key: String::new(),
            secret_key: String::new(),
            heartbeat_timeout_ms: 10_000,
            pending_timeout_ms: 60_000,
            tick_ms: 100,
        }
    }
}

impl BrokerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Client (protocol engine) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Period of heartbeats for every channel this client produces
    pub heartbeat_interval_ms: u64,
    /// Worker wakeup granularity
    pub tick_ms: u64,
    /// Length of one discovery attempt while the channel is not ready
    pub discovery_retry_ms: u64,
    /// Host the data-plane sockets bind to and advertise
    pub data_bind_host: String,
    /// Payload capacity of shared-memory channels created by this client
    pub shm_capacity: usize,
    /// Wait bound for a segment's init lock when attaching
    pub shm_lock_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2_000,
            tick_ms: 100,
            discovery_retry_ms: 200,
            data_bind_host: "127.0.0.1".to_string(),
            shm_capacity: DEFAULT_SHM_CAPACITY,
            shm_lock_timeout_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn discovery_retry(&self) -> Duration {
        Duration::from_millis(self.discovery_retry_ms.max(1))
    }

    pub fn shm_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.shm_lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"heartbeat_interval_ms": 500, "data_bind_host": "0.0.0.0"}}"#).unwrap();

        let config = ClientConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.data_bind_host, "0.0.0.0");
        assert_eq!(config.tick_ms, ClientConfig::default().tick_ms);
        assert_eq!(config.shm_capacity, DEFAULT_SHM_CAPACITY);
    }

    #[test]
    fn test_broker_config_round_trip() {
        let config = BrokerConfig {
            heartbeat_timeout_ms: 1234,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        assert_eq!(BrokerConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        assert!(matches!(
            BrokerConfig::from_json_file("/nonexistent/switchyard.json"),
            Err(SwitchyardError::ConfigRead { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            BrokerConfig::from_json_file(file.path()),
            Err(SwitchyardError::Json(_))
        ));
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let config = ClientConfig {
            tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.tick(), Duration::from_millis(1));
    }
}
