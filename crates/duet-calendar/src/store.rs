//! Persisted blob storage backing the second cache tier.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Durable key → bytes storage with per-key write timestamps.
///
/// No transactional guarantees; callers treat every failure as a miss.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite `key`, stamping it with `written_at`.
    fn set(&self, key: &str, value: &[u8], written_at: DateTime<Utc>) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// When `key` was last written.
    fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Remove every key starting with `prefix`.
    fn remove_prefix(&self, prefix: &str) -> Result<()>;
}

/// SQLite-backed blob store.
pub struct SqliteBlobStore {
    conn: Mutex<Connection>,
}

impl SqliteBlobStore {
    /// Open or create a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                written_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl BlobStore for SqliteBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .lock()
            .query_row("SELECT value FROM blobs WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8], written_at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO blobs (key, value, written_at) VALUES (?1, ?2, ?3)",
            params![key, value, written_at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM blobs WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT written_at FROM blobs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        // substr avoids LIKE wildcards in keys
        self.conn.lock().execute(
            "DELETE FROM blobs WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(())
    }
}

/// Process-local blob store; contents vanish with the process.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).map(|(value, _)| value.clone()))
    }

    fn set(&self, key: &str, value: &[u8], written_at: DateTime<Utc>) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_vec(), written_at));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.entries.lock().get(key).map(|(_, at)| *at))
    }

    fn remove_prefix(&self, prefix: &str) -> Result<()> {
        self.entries.lock().retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose every operation fails, as with a full or read-only disk.
    #[derive(Default)]
    pub(crate) struct FailingBlobStore {
        pub calls: AtomicUsize,
    }

    impl FailingBlobStore {
        fn fail<T>(&self) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("disk I/O error"))
        }
    }

    impl BlobStore for FailingBlobStore {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            self.fail()
        }

        fn set(&self, _key: &str, _value: &[u8], _written_at: DateTime<Utc>) -> Result<()> {
            self.fail()
        }

        fn remove(&self, _key: &str) -> Result<()> {
            self.fail()
        }

        fn timestamp(&self, _key: &str) -> Result<Option<DateTime<Utc>>> {
            self.fail()
        }

        fn remove_prefix(&self, _prefix: &str) -> Result<()> {
            self.fail()
        }
    }

    fn exercise(store: &dyn BlobStore) {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();

        assert!(store.get("a").unwrap().is_none());
        assert!(store.timestamp("a").unwrap().is_none());

        store.set("cache:a", b"one", at).unwrap();
        store.set("cache:b", b"two", at).unwrap();
        store.set("other:c", b"three", at).unwrap();

        assert_eq!(store.get("cache:a").unwrap().unwrap(), b"one");
        assert_eq!(store.timestamp("cache:a").unwrap(), Some(at));

        store.set("cache:a", b"uno", at).unwrap();
        assert_eq!(store.get("cache:a").unwrap().unwrap(), b"uno");

        store.remove("cache:a").unwrap();
        assert!(store.get("cache:a").unwrap().is_none());

        store.remove_prefix("cache:").unwrap();
        assert!(store.get("cache:b").unwrap().is_none());
        assert_eq!(store.get("other:c").unwrap().unwrap(), b"three");
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryBlobStore::new());
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteBlobStore::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();

        SqliteBlobStore::new(&path)
            .unwrap()
            .set("k", b"persisted", at)
            .unwrap();

        let reopened = SqliteBlobStore::new(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().unwrap(), b"persisted");
        assert_eq!(reopened.timestamp("k").unwrap(), Some(at));
    }

    #[test]
    fn test_prefix_with_wildcard_characters() {
        let store = SqliteBlobStore::in_memory().unwrap();
        let at = Utc::now();
        store.set("a_b:1", b"x", at).unwrap();
        store.set("axb:1", b"y", at).unwrap();

        store.remove_prefix("a_b:").unwrap();
        assert!(store.get("a_b:1").unwrap().is_none());
        assert!(store.get("axb:1").unwrap().is_some());
    }

    #[test]
    fn test_failing_store_reports_errors() {
        let store = FailingBlobStore::default();
        assert!(store.get("k").is_err());
        assert!(store.set("k", b"v", Utc::now()).is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }
}
