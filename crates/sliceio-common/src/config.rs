//! Configuration types for SliceIO
//!
//! Every structure deserializes from TOML with per-field defaults, so a
//! config file only needs to mention the values it overrides.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Heartbeat and reconnect timing shared by broker and channels
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Heartbeat interval (milliseconds)
    pub interval_ms: u64,
    /// Missed heartbeats tolerated before a peer is considered dead
    pub liveness: u32,
    /// First reconnect backoff (milliseconds)
    pub reconnect_initial_ms: u64,
    /// Reconnect backoff cap (milliseconds)
    pub reconnect_max_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            liveness: 5,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 32_000,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// How long a worker stays registered without a liveness signal
    #[must_use]
    pub const fn expiry(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(self.liveness as u64))
    }

    #[must_use]
    pub const fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    #[must_use]
    pub const fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Key-value engine backing a bucket's slice and metadata databases
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Discard payloads; useful to benchmark the routing path
    None,
    /// Append-only record file with an in-memory index
    LogFile,
    /// One redb database file per slice database
    #[default]
    Redb,
    /// In-process map (tests)
    Memory,
}

impl StorageBackend {
    /// Lowercase name as used in config files and on the command line
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::LogFile => "logfile",
            Self::Redb => "redb",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "logfile" => Ok(Self::LogFile),
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => Err(Error::configuration(format!(
                "unknown storage backend '{other}' (expected none, logfile, redb or memory)"
            ))),
        }
    }
}

/// Per-bucket storage configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Engine used for slice and metadata databases
    pub backend: StorageBackend,
    /// Nominal capacity of one slice database (default: 800 MB)
    pub max_dbsize: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            max_dbsize: 800 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// True once a slice database has grown past 90% of `max_dbsize`
    #[must_use]
    pub const fn needs_rotation(&self, db_size: u64) -> bool {
        (db_size as u128) * 10 > (self.max_dbsize as u128) * 9
    }
}

/// Broker process configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Client-facing listen address
    pub frontend: String,
    /// Worker-facing listen address
    pub backend: String,
    /// Health and metrics HTTP listen address (disabled when unset)
    pub http_listen: Option<String>,
    /// Answer every request with ACK without dispatching it
    pub stub: bool,
    /// Heartbeat timing
    pub heartbeat: HeartbeatConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend: "0.0.0.0:19977".to_string(),
            backend: "0.0.0.0:19978".to_string(),
            http_listen: None,
            stub: false,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Datanode process configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatanodeConfig {
    /// Identifier announced to the broker
    pub datanode_id: u32,
    /// Broker backend address
    pub broker_endpoint: String,
    /// Number of buckets (storage shards)
    pub total_buckets: u32,
    /// Number of broker channels per bucket
    pub total_channels: u32,
    /// Root directory holding one directory per bucket
    pub data_dir: PathBuf,
    /// Storage engine settings
    pub storage: StorageConfig,
    /// Heartbeat timing
    pub heartbeat: HeartbeatConfig,
}

impl Default for DatanodeConfig {
    fn default() -> Self {
        Self {
            datanode_id: 0,
            broker_endpoint: "127.0.0.1:19978".to_string(),
            total_buckets: 4,
            total_channels: 2,
            data_dir: PathBuf::from("./data/storage"),
            storage: StorageConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}
