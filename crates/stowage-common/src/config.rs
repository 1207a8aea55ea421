//! Configuration types for Stowage
//!
//! This module defines configuration structures used across components.
//! Every section implements `Default` and deserializes with missing fields
//! filled in, so a partial TOML file is always valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for Stowage
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Write-ahead log configuration
    pub wal: WalConfig,
    /// WAL processor configuration
    pub processor: ProcessorConfig,
    /// Backend health monitor configuration
    pub health: HealthConfig,
    /// Tiered cache configuration
    pub cache: CacheConfig,
    /// Replication policy configuration
    pub replication: ReplicationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.wal.max_partition_entries == 0 {
            return Err(Error::Configuration(
                "wal.max_partition_entries must be > 0".into(),
            ));
        }
        if self.processor.workers == 0 {
            return Err(Error::Configuration("processor.workers must be > 0".into()));
        }
        if self.processor.default_max_attempts == 0 {
            return Err(Error::Configuration(
                "processor.default_max_attempts must be > 0".into(),
            ));
        }
        if self.health.trip_threshold == 0 {
            return Err(Error::Configuration(
                "health.trip_threshold must be > 0".into(),
            ));
        }
        if self.cache.capacity_entries == 0 {
            return Err(Error::Configuration(
                "cache.capacity_entries must be > 0".into(),
            ));
        }
        if !(self.cache.hot_fraction > 0.0 && self.cache.hot_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "cache.hot_fraction must be in (0, 1], got {}",
                self.cache.hot_fraction
            )));
        }
        if self.replication.factor == 0 {
            return Err(Error::Configuration(
                "replication.factor must be > 0".into(),
            ));
        }
        if self.processor.backend_timeout_ms == 0 {
            return Err(Error::Configuration(
                "processor.backend_timeout_ms must be > 0".into(),
            ));
        }
        for (name, secs) in [
            ("wal.max_partition_age_secs", self.wal.max_partition_age_secs),
            ("wal.retention_secs", self.wal.retention_secs),
            ("processor.lease_ms", self.processor.lease_ms / 1000),
            ("health.cooldown_ms", self.health.cooldown_ms / 1000),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(Error::Configuration(format!(
                    "{name} exceeds {MAX_DURATION_SECS} seconds"
                )));
            }
        }
        Ok(())
    }
}

/// Upper bound on any duration setting (100 years)
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn milliseconds(ms: u64) -> chrono::Duration {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Write-ahead log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Root directory (one subdirectory per backend)
    pub dir: PathBuf,
    /// fsync every record before acknowledging
    pub sync_on_write: bool,
    /// Seal the active partition after this many records
    pub max_partition_entries: u64,
    /// Seal the active partition once its first record is this old
    pub max_partition_age_secs: u64,
    /// Total bytes the WAL may occupy across all partitions
    pub max_total_bytes: u64,
    /// Completed operations older than this are eligible for compaction
    pub retention_secs: u64,
    /// Buffer size for partition writers
    pub write_buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./stowage-wal"),
            sync_on_write: true,
            max_partition_entries: 10_000,
            max_partition_age_secs: 60 * 60,            // 1 hour
            max_total_bytes: 1024 * 1024 * 1024,        // 1 GB
            retention_secs: 7 * 24 * 60 * 60,           // 7 days
            write_buffer_size: 64 * 1024,               // 64KB
        }
    }
}

impl WalConfig {
    #[must_use]
    pub fn max_partition_age(&self) -> chrono::Duration {
        seconds(self.max_partition_age_secs)
    }

    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        seconds(self.retention_secs)
    }
}

/// WAL processor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Sleep between polls when there is no eligible work
    pub poll_interval_ms: u64,
    /// Upper bound on a single backend call
    pub backend_timeout_ms: u64,
    /// Attempt budget when the submitter does not give one
    pub default_max_attempts: u32,
    /// Base delay for exponential backoff
    pub backoff_base_ms: u64,
    /// Maximum backoff delay (before jitter)
    pub backoff_cap_ms: u64,
    /// Jitter added on top of the delay, as a fraction of it
    pub jitter_ratio: f64,
    /// How long a claim stays owned without completing
    pub lease_ms: u64,
    /// Interval of the expired-lease recovery sweep
    pub lease_sweep_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 100,
            backend_timeout_ms: 30_000,
            default_max_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 5 * 60 * 1000, // 5 minutes
            jitter_ratio: 0.2,
            lease_ms: 2 * 60 * 1000,
            lease_sweep_interval_ms: 30_000,
        }
    }
}

impl ProcessorConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    #[must_use]
    pub const fn lease_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease_sweep_interval_ms)
    }

    #[must_use]
    pub fn lease(&self) -> chrono::Duration {
        milliseconds(self.lease_ms)
    }
}

/// Backend health monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that open the circuit
    pub trip_threshold: u32,
    /// Time an open circuit waits before a probe is allowed
    pub cooldown_ms: u64,
    /// Interval between background probes
    pub probe_interval_ms: u64,
    /// Upper bound on a single probe
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            cooldown_ms: 30_000,
            probe_interval_ms: 10_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        milliseconds(self.cooldown_ms)
    }

    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Tiered cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory for warm (on-disk) residency
    pub dir: PathBuf,
    /// ARC logical capacity `C`, in entries
    pub capacity_entries: usize,
    /// Fraction of `C` kept in memory (hot tier)
    pub hot_fraction: f64,
    /// Memory bound of the hot tier
    pub hot_max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./stowage-cache"),
            capacity_entries: 4096,
            hot_fraction: 0.25,
            hot_max_bytes: 256 * 1024 * 1024, // 256MB
        }
    }
}

impl CacheConfig {
    /// Entry bound of the hot tier
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn hot_max_entries(&self) -> usize {
        ((self.capacity_entries as f64 * self.hot_fraction).ceil() as usize).max(1)
    }
}

/// Replication policy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Required number of backend copies
    pub factor: usize,
    /// Attempt budget of generated transfer operations
    pub transfer_max_attempts: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: 2,
            transfer_max_attempts: 5,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
