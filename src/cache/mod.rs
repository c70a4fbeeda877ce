//! Response cache shared by all workers.
//!
//! # Data Flow
//! ```text
//! GET cache key
//!     → Cache::lookup (TTL check, lazy eviction)
//!     → CacheStore (Fs: one file per key | Db: one row per key)
//!     → Hit(payload) | Miss | Unreadable
//! ```
//!
//! # Design Decisions
//! - The payload is the origin response without its status line
//! - First writer wins; saving an existing key is a no-op
//! - Readers never observe a partially written entry

pub mod db;
pub mod fs;

use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::config::{StorageConfig, StorageKind};

pub use db::DbStore;
pub use fs::FsStore;

/// Error type for cache storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("key {0:?} cannot be stored")]
    InvalidKey(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Operations every cache backend provides.
pub trait CacheBackend: Send + Sync {
    /// When the entry was stored, or `None` if there is no entry.
    fn lookup_timestamp(&self, key: &str) -> Result<Option<SystemTime>, StoreError>;

    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `data` under `key`. Returns `false` if the key already existed.
    fn save(&self, key: &str, data: &[u8]) -> Result<bool, StoreError>;

    fn erase(&self, key: &str) -> Result<(), StoreError>;
}

/// The backend selected by the `storage` tag.
#[derive(Debug)]
pub enum CacheStore {
    Fs(FsStore),
    Db(DbStore),
}

impl CacheStore {
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        match config.storage {
            StorageKind::Fs => Ok(CacheStore::Fs(FsStore::new(&config.cache_path))),
            StorageKind::Db => Ok(CacheStore::Db(DbStore::open(&config.db_path)?)),
        }
    }

    /// Prepare the backend once at startup, before workers exist.
    pub fn initialize(config: &StorageConfig) -> Result<(), StoreError> {
        match config.storage {
            StorageKind::Fs => std::fs::create_dir_all(&config.cache_path)?,
            StorageKind::Db => DbStore::initialize(&config.db_path)?,
        }
        Ok(())
    }
}

impl CacheBackend for CacheStore {
    fn lookup_timestamp(&self, key: &str) -> Result<Option<SystemTime>, StoreError> {
        match self {
            CacheStore::Fs(store) => store.lookup_timestamp(key),
            CacheStore::Db(store) => store.lookup_timestamp(key),
        }
    }

    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            CacheStore::Fs(store) => store.fetch(key),
            CacheStore::Db(store) => store.fetch(key),
        }
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<bool, StoreError> {
        match self {
            CacheStore::Fs(store) => store.save(key, data),
            CacheStore::Db(store) => store.save(key, data),
        }
    }

    fn erase(&self, key: &str) -> Result<(), StoreError> {
        match self {
            CacheStore::Fs(store) => store.erase(key),
            CacheStore::Db(store) => store.erase(key),
        }
    }
}

/// Result of a cache lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    Hit(Vec<u8>),
    Miss,
    /// The entry exists but could not be read.
    Unreadable,
}

/// A backend plus its expiry policy.
#[derive(Debug)]
pub struct Cache<B = CacheStore> {
    store: B,
    discard_after: Duration,
}

impl Cache<CacheStore> {
    pub fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        Ok(Self::new(CacheStore::open(config)?, config.discard_after()))
    }
}

impl<B: CacheBackend> Cache<B> {
    pub fn new(store: B, discard_after: Duration) -> Self {
        Self {
            store,
            discard_after,
        }
    }

    /// Look `key` up, evicting it first if it is older than the TTL.
    pub fn lookup(&self, key: &str) -> Lookup {
        let stored_at = match self.store.lookup_timestamp(key) {
            Ok(Some(stored_at)) => stored_at,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                tracing::warn!(key, error = %e, "Cache lookup failed");
                return Lookup::Miss;
            }
        };

        let age = SystemTime::now()
            .duration_since(stored_at)
            .unwrap_or_default();
        if age > self.discard_after {
            tracing::debug!(key, age_secs = age.as_secs(), "Cache entry expired");
            if let Err(e) = self.store.erase(key) {
                tracing::warn!(key, error = %e, "Cache erase failed");
            }
            return Lookup::Miss;
        }

        match self.store.fetch(key) {
            Ok(Some(payload)) => Lookup::Hit(payload),
            Ok(None) => Lookup::Unreadable,
            Err(e) => {
                tracing::error!(key, error = %e, "Cache read failed");
                Lookup::Unreadable
            }
        }
    }

    /// Save a payload unless the key is already cached. Failures are logged only.
    pub fn store_if_absent(&self, key: &str, payload: &[u8]) {
        match self.store.save(key, payload) {
            Ok(true) => tracing::debug!(key, bytes = payload.len(), "Cached response"),
            Ok(false) => tracing::debug!(key, "Already cached"),
            Err(e) => tracing::error!(key, error = %e, "Cache write failed"),
        }
    }

    pub fn store(&self) -> &B {
        &self.store
    }
}
