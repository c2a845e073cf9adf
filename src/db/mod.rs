//! SQLite connection helpers shared by the cache store and the retry queue.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{RelayError, RelayResult};

/// A single SQLite connection guarded for use across tasks.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path` and apply `schema`.
  pub fn open(path: &Path, schema: &str) -> RelayResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        RelayError::storage(format!("Failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      RelayError::storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;
    // Other processes may hold the write lock briefly
    conn.busy_timeout(Duration::from_secs(5))?;

    Self::with_connection(conn, schema)
  }

  /// Open a private in-memory database. Contents vanish when dropped.
  #[cfg(test)]
  pub fn open_in_memory(schema: &str) -> RelayResult<Self> {
    let conn = Connection::open_in_memory()?;
    Self::with_connection(conn, schema)
  }

  fn with_connection(conn: Connection, schema: &str) -> RelayResult<Self> {
    conn
      .execute_batch(schema)
      .map_err(|e| RelayError::storage(format!("Failed to run migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Lock the connection for the duration of one operation.
  pub fn conn(&self) -> RelayResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| RelayError::storage(format!("Lock poisoned: {}", e)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn open_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("test.db");

    let db = Database::open(&path, "CREATE TABLE IF NOT EXISTS t (x INTEGER);").unwrap();
    db.conn()
      .unwrap()
      .execute("INSERT INTO t (x) VALUES (1)", [])
      .unwrap();

    assert!(path.exists());
  }

  #[test]
  fn bad_schema_is_storage_unavailable() {
    let err = Database::open_in_memory("NOT SQL").err().unwrap();
    assert!(matches!(err, RelayError::StorageUnavailable(_)));
  }
}
