//! Hub configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionConfig;

/// Shortest idle grace a session is given. A session evicted as soon as it
/// starts could never be joined.
pub const MIN_IDLE_GRACE: Duration = Duration::from_millis(100);

/// Shortest ping interval.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Where document snapshots are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process memory only; nothing survives a restart.
    Memory,
    /// One file per document under the given directory.
    File(PathBuf),
    /// RocksDB database at the given path (needs the `rocksdb` feature).
    Rocks(PathBuf),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Quiet period after the last edit before a snapshot is written
    pub save_debounce: Duration,
    /// How long a session without participants stays loaded
    pub idle_grace: Duration,
    /// Ping interval; a connection silent for two intervals is dropped
    pub heartbeat_interval: Duration,
    /// Command queue capacity per session
    pub session_queue_capacity: usize,
    /// Maximum participants per document
    pub max_participants: usize,
    pub storage: StorageBackend,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            save_debounce: Duration::from_millis(2000),
            idle_grace: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            session_queue_capacity: 256,
            max_participants: 100,
            storage: StorageBackend::File(PathBuf::from("scrivener_data")),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl HubConfig {
    /// Defaults with in-memory storage.
    pub fn in_memory() -> Self {
        Self {
            storage: StorageBackend::Memory,
            ..Self::default()
        }
    }

    /// Defaults overridden by `SCRIVENER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `SCRIVENER_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("SCRIVENER_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SCRIVENER_SAVE_DEBOUNCE_MS")? {
            config.save_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = positive(&lookup, "SCRIVENER_IDLE_GRACE_SECS")? {
            config.idle_grace = Duration::from_secs(secs as u64);
        }
        if let Some(secs) = positive(&lookup, "SCRIVENER_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs as u64);
        }
        if let Some(limit) = positive(&lookup, "SCRIVENER_MAX_PARTICIPANTS")? {
            config.max_participants = limit;
        }

        let data_dir = lookup("SCRIVENER_DATA_DIR").map(PathBuf::from);
        match lookup("SCRIVENER_STORE").as_deref() {
            None => {
                if let Some(dir) = data_dir {
                    config.storage = StorageBackend::File(dir);
                }
            }
            Some("memory") => config.storage = StorageBackend::Memory,
            Some("file") => {
                config.storage =
                    StorageBackend::File(data_dir.unwrap_or_else(|| PathBuf::from("scrivener_data")))
            }
            Some("rocksdb") => {
                config.storage =
                    StorageBackend::Rocks(data_dir.unwrap_or_else(|| PathBuf::from("scrivener_rocks")))
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "SCRIVENER_STORE",
                    value: other.to_string(),
                    reason: "expected memory, file or rocksdb".to_string(),
                })
            }
        }

        Ok(config)
    }

    /// Ping interval, never shorter than [`MIN_HEARTBEAT_INTERVAL`].
    pub fn heartbeat(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }

    /// Per-session settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            save_debounce: self.save_debounce,
            idle_grace: self.idle_grace.max(MIN_IDLE_GRACE),
            queue_capacity: self.session_queue_capacity.max(1),
            max_participants: self.max_participants,
        }
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<usize>, ConfigError> {
    match parse::<usize>(lookup, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}
