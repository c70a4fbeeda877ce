//! SQLite cache backend.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::cache::{CacheBackend, StoreError};

/// Every worker opens its own connection; the busy timeout covers writer contention.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct DbStore {
    conn: Mutex<Connection>,
}

impl DbStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        create_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create the database file and its table if they do not exist yet.
    pub fn initialize(path: &Path) -> Result<(), StoreError> {
        let store = Self::open(path)?;
        tracing::info!(path = %path.display(), "Cache database ready");
        drop(store);
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&conn)?)
    }
}

fn create_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            url TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            content BLOB NOT NULL
        );",
    )
}

impl CacheBackend for DbStore {
    fn lookup_timestamp(&self, key: &str) -> Result<Option<SystemTime>, StoreError> {
        let secs: Option<i64> = self.with_conn(|conn| {
            conn.query_row("SELECT timestamp FROM files WHERE url = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
        })?;
        Ok(secs.map(|s| UNIX_EPOCH + Duration::from_secs(s.max(0) as u64)))
    }

    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT content FROM files WHERE url = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    fn save(&self, key: &str, data: &[u8]) -> Result<bool, StoreError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let inserted = self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO files (url, timestamp, content) VALUES (?1, ?2, ?3)",
                params![key, now, data],
            )
        })?;
        Ok(inserted == 1)
    }

    fn erase(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.execute("DELETE FROM files WHERE url = ?1", [key]))?;
        Ok(())
    }
}
