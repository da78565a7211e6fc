//! Configuration for wish-market

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::MarketError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wish-market")
}

/// Longest lease accepted for a claim
pub const MAX_LEASE_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Which store variant to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(MarketError::Config(format!("Unknown store backend: {}", other))),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Sqlite => f.write_str("sqlite"),
            StoreBackend::Memory => f.write_str("memory"),
        }
    }
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the marketplace and ingestion databases
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Store variant
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Lease length applied to every claim
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Funding reconciler tick
    #[serde(default = "default_funding_interval")]
    pub funding_interval_secs: u64,

    /// Ingestion reconciler tick
    #[serde(default = "default_ingestion_interval")]
    pub ingestion_interval_secs: u64,

    /// Records pulled per ingestion tick
    #[serde(default = "default_ingestion_batch")]
    pub ingestion_batch_size: usize,

    /// Events kept in the in-memory log
    #[serde(default = "default_event_capacity")]
    pub event_log_capacity: usize,

    /// Per-subscriber event channel size
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Block height reported by the simulated funding provider
    #[serde(default = "default_block_height")]
    pub simulated_block_height: u64,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_lease_ttl() -> u64 {
    72 * 60 * 60
}

fn default_funding_interval() -> u64 {
    60
}

fn default_ingestion_interval() -> u64 {
    30
}

fn default_ingestion_batch() -> usize {
    25
}

fn default_event_capacity() -> usize {
    200
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_block_height() -> u64 {
    840_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            backend: default_backend(),
            lease_ttl_secs: default_lease_ttl(),
            funding_interval_secs: default_funding_interval(),
            ingestion_interval_secs: default_ingestion_interval(),
            ingestion_batch_size: default_ingestion_batch(),
            event_log_capacity: default_event_capacity(),
            subscriber_buffer: default_subscriber_buffer(),
            simulated_block_height: default_block_height(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject values the reconcilers, event log and leases cannot run with
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.lease_ttl_secs > MAX_LEASE_TTL_SECS {
            return Err(MarketError::Config(format!(
                "lease_ttl_secs must be at most {} (ten years)",
                MAX_LEASE_TTL_SECS
            )));
        }
        if self.funding_interval_secs == 0 || self.ingestion_interval_secs == 0 {
            return Err(MarketError::Config("reconciler intervals must be non-zero".into()));
        }
        if self.ingestion_batch_size == 0 {
            return Err(MarketError::Config("ingestion_batch_size must be non-zero".into()));
        }
        if self.event_log_capacity == 0 {
            return Err(MarketError::Config("event_log_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Lease length as a chrono duration
    pub fn lease_ttl(&self) -> Result<Duration, MarketError> {
        i64::try_from(self.lease_ttl_secs)
            .ok()
            .filter(|secs| *secs as u64 <= MAX_LEASE_TTL_SECS)
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                MarketError::Config(format!("lease_ttl_secs {} is out of range", self.lease_ttl_secs))
            })
    }

    /// Marketplace database path
    pub fn market_db_path(&self) -> PathBuf {
        self.storage_dir.join("market.db")
    }

    /// Ingestion queue database path
    pub fn ingestion_db_path(&self) -> PathBuf {
        self.storage_dir.join("ingestion.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
