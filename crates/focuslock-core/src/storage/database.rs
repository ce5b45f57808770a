//! SQLite-backed key-value storage.
//!
//! Holds the serialized restriction list and the focus end time in a single
//! `kv` table keyed by name.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{data_dir, KeyValueStore};
use crate::error::{CoreError, PersistenceError};

/// SQLite database used as the durable mirror.
pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Open the database at `<data_dir>/focuslock.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, CoreError> {
        let path = data_dir()?.join("focuslock.db");
        Ok(Self::open_at(&path)?)
    }

    /// Open the database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path).map_err(|source| PersistenceError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), PersistenceError> {
        self.with_conn("", |conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                    key        TEXT PRIMARY KEY,
                    value      BLOB NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );",
            )
        })
    }

    fn with_conn<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, PersistenceError> {
        let conn = self.conn.lock().map_err(|_| PersistenceError::Backend {
            key: key.to_string(),
            message: "connection mutex poisoned".into(),
        })?;
        f(&conn).map_err(|err| match PersistenceError::from(err) {
            PersistenceError::Backend { message, .. } => PersistenceError::Backend {
                key: key.to_string(),
                message,
            },
            other => other,
        })
    }
}

impl KeyValueStore for SqliteKv {
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        self.with_conn(key, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, blob],
            )
            .map(|_| ())
        })
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.with_conn(key, |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_store() {
        let db = SqliteKv::open_memory().unwrap();
        assert!(db.load("test").unwrap().is_none());
        db.save("test", b"hello").unwrap();
        assert_eq!(db.load("test").unwrap().unwrap(), b"hello");
        db.save("test", b"again").unwrap();
        assert_eq!(db.load("test").unwrap().unwrap(), b"again");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("focuslock.db");
        {
            let db = SqliteKv::open_at(&path).unwrap();
            db.save("restrictions", b"[]").unwrap();
        }
        let db = SqliteKv::open_at(&path).unwrap();
        assert_eq!(db.load("restrictions").unwrap().unwrap(), b"[]");
    }
}
