//! Configuration for the transactor

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable prefix used by [`Config::from_env`]
pub const ENV_PREFIX: &str = "TRANSACTOR";

/// Transactor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Ledger engine configuration
    pub engine: EngineConfig,

    /// Broadcast hub configuration
    pub broadcast: BroadcastConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/transactor"),
            service_name: "transactor".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            engine: EngineConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max open file handles (-1 keeps every file open)
    pub max_open_files: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_open_files: 512,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Ledger engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Work items admitted before `submit` starts failing with `QueueFull`
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
        }
    }
}

/// Broadcast hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Capacity of the engine → dispatcher event channel
    pub event_capacity: usize,

    /// Per-subscriber buffer; a subscriber that falls this far behind is dropped
    pub subscriber_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1000,
            subscriber_buffer: 256,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Some(data_dir) = env_var("DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Some(value) = env_var("DB_MAX_OPEN_FILES") {
            config.rocksdb.max_open_files = parse_env("DB_MAX_OPEN_FILES", &value)?;
        }

        if let Some(value) = env_var("DB_MAX_BACKGROUND_JOBS") {
            config.rocksdb.max_background_jobs = parse_env("DB_MAX_BACKGROUND_JOBS", &value)?;
        }

        if let Some(value) = env_var("QUEUE_CAPACITY") {
            config.engine.queue_capacity = parse_env("QUEUE_CAPACITY", &value)?;
        }

        if let Some(value) = env_var("EVENT_CAPACITY") {
            config.broadcast.event_capacity = parse_env("EVENT_CAPACITY", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.engine.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "engine.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.broadcast.event_capacity == 0 || self.broadcast.subscriber_buffer == 0 {
            return Err(crate::Error::Config(
                "broadcast buffers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value.parse().map_err(|_| {
        crate::Error::Config(format!("{}_{} has invalid value {:?}", ENV_PREFIX, name, value))
    })
}
