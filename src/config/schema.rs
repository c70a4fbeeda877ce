//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Cache storage selection and behaviour.
    pub storage: StorageConfig,

    /// Logging destination and verbosity.
    pub general: GeneralConfig,

    /// Socket timeouts used by workers.
    pub timeouts: TimeoutConfig,

    /// Dispatcher loop settings.
    pub dispatcher: DispatcherConfig,
}

/// Which cache backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum StorageKind {
    /// Files under `cache_path`, one file per cache key.
    #[serde(rename = "FS")]
    Fs,
    /// SQLite database at `db_path`.
    #[serde(rename = "DB")]
    Db,
}

/// Cache storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend tag (`"FS"` or `"DB"`).
    pub storage: StorageKind,

    /// Serve and save GET responses through the cache.
    pub enable_cache: bool,

    /// Entries older than this many seconds are discarded on lookup.
    pub cache_discard_after: u64,

    /// Root directory of the FS backend.
    pub cache_path: PathBuf,

    /// Database file of the DB backend.
    pub db_path: PathBuf,
}

impl StorageConfig {
    pub fn discard_after(&self) -> Duration {
        Duration::from_secs(self.cache_discard_after)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Fs,
            enable_cache: true,
            cache_discard_after: 3600,
            cache_path: PathBuf::from("cache"),
            db_path: PathBuf::from("proxy_cache.db"),
        }
    }
}

/// General settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory receiving `proxy.log`.
    pub log_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("LOGS"),
            log_level: "info".to_string(),
        }
    }
}

/// Timeout configuration for worker socket operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-read timeout on the client socket, in seconds.
    pub client_read_secs: u64,

    /// Origin connection establishment timeout in seconds.
    pub origin_connect_secs: u64,

    /// Per-read timeout on the origin socket, in seconds.
    pub origin_read_secs: u64,

    /// Idle timeout of a CONNECT tunnel, in seconds.
    pub tunnel_read_secs: u64,

    /// Bound on writing one buffer to the client or the origin, in seconds.
    pub write_secs: u64,
}

impl TimeoutConfig {
    pub fn client_read(&self) -> Duration {
        Duration::from_secs(self.client_read_secs)
    }

    pub fn origin_connect(&self) -> Duration {
        Duration::from_secs(self.origin_connect_secs)
    }

    pub fn origin_read(&self) -> Duration {
        Duration::from_secs(self.origin_read_secs)
    }

    pub fn tunnel_read(&self) -> Duration {
        Duration::from_secs(self.tunnel_read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            client_read_secs: 10,
            origin_connect_secs: 10,
            origin_read_secs: 10,
            tunnel_read_secs: 5,
            write_secs: 10,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum ready-but-unassigned connections; 0 means unbounded.
    pub max_pending: usize,

    /// How often idle client sockets are probed for TCP state, in seconds.
    pub probe_interval_secs: u64,

    /// Prometheus exporter bind address; empty disables the exporter.
    pub metrics_address: String,
}

impl DispatcherConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_pending: 0,
            probe_interval_secs: 1,
            metrics_address: String::new(),
        }
    }
}
