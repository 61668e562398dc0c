//! TOML configuration.
//!
//! Every field has a default so a minimal file only names `db_path`.
//! Sections configuring external collaborators (broker TLS, object-store
//! credentials, HTTP endpoints) are accepted and ignored here; the core
//! consumes only the knobs below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,
    /// 0 derives a stable id from the machine hostname.
    pub node_id: u64,
    /// Defaults to `{db_path}-seq-map`.
    pub seq_map_path: String,
    /// Publish local changes.
    pub publish: bool,
    /// Apply remote changes.
    pub replicate: bool,
    pub scan_max_changes: usize,
    /// Milliseconds between published-row cleanups.
    pub cleanup_interval: u64,
    /// Milliseconds for the forced scanner wake-up; 0 disables it.
    pub sleep_timeout: u64,
    /// Milliseconds; 0 uses the filesystem watcher instead of polling.
    pub polling_interval: u64,
    /// Milliseconds before a schema-mismatched message is redelivered.
    pub schema_nak_delay: u64,
    /// Milliseconds between local hash recomputes while paused.
    pub schema_recompute_interval: u64,
    /// Watched tables; empty watches every user table.
    pub tables: Vec<String>,
    pub connection_pool_size: usize,
    pub replication_log: ReplicationLogConfig,
    pub snapshot: SnapshotConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            node_id: 0,
            seq_map_path: String::new(),
            publish: true,
            replicate: true,
            scan_max_changes: 512,
            cleanup_interval: 5_000,
            sleep_timeout: 0,
            polling_interval: 0,
            schema_nak_delay: 30_000,
            schema_recompute_interval: 300_000,
            tables: Vec::new(),
            connection_pool_size: 4,
            replication_log: ReplicationLogConfig::default(),
            snapshot: SnapshotConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplicationLogConfig {
    pub shards: u64,
    pub max_entries: u64,
    pub replicas: usize,
    pub compress: bool,
    pub update_existing: bool,
}

impl Default for ReplicationLogConfig {
    fn default() -> Self {
        Self {
            shards: 1,
            max_entries: 1024,
            replicas: 1,
            compress: true,
            update_existing: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    /// Backend name; this build bundles `fs` and `broker`.
    pub store: String,
    /// Milliseconds between timed snapshots; 0 relies on the
    /// sequence-driven cadence alone.
    pub interval: u64,
    /// Milliseconds the snapshot-leader lease lives without renewal.
    pub leader_ttl: u64,
    pub fs: FsStoreConfig,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store: "fs".to_owned(),
            interval: 0,
            leader_ttl: 30_000,
            fs: FsStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FsStoreConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg: Config = toml::from_str(text)?;
        cfg.apply_derived_defaults();
        Ok(cfg)
    }

    fn apply_derived_defaults(&mut self) {
        if self.seq_map_path.is_empty() && !self.db_path.is_empty() {
            self.seq_map_path = format!("{}-seq-map", self.db_path);
        }
        if self.node_id == 0 {
            self.node_id = derived_node_id();
        }
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.db_path)
    }

    pub fn seq_map_path(&self) -> PathBuf {
        PathBuf::from(&self.seq_map_path)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval)
    }

    pub fn polling_interval(&self) -> Option<Duration> {
        (self.polling_interval > 0).then(|| Duration::from_millis(self.polling_interval))
    }

    pub fn sleep_timeout(&self) -> Option<Duration> {
        (self.sleep_timeout > 0).then(|| Duration::from_millis(self.sleep_timeout))
    }

    pub fn schema_nak_delay(&self) -> Duration {
        Duration::from_millis(self.schema_nak_delay)
    }

    pub fn schema_recompute_interval(&self) -> Duration {
        Duration::from_millis(self.schema_recompute_interval)
    }

    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot.interval > 0).then(|| Duration::from_millis(self.snapshot.interval))
    }

    pub fn leader_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot.leader_ttl)
    }
}

/// Stable id hashed from the hostname, for nodes that configure none.
fn derived_node_id() -> u64 {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "harmonylite".to_owned());
    rapidhash::rapidhash(hostname.as_bytes()).max(1)
}
