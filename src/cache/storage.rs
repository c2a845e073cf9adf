//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;

use super::generation::Slot;
use super::types::{GenerationHandle, ResourceEntry};
use crate::db::Database;
use crate::error::{RelayError, RelayResult};
use crate::request::ResourceKey;

/// Trait for cache storage backends.
///
/// Every operation is a single statement or transaction, so a `put` racing a
/// `get` on the same key is observed either entirely before or entirely after
/// the read.
pub trait CacheStorage: Send + Sync + 'static {
  /// Get a handle to a namespace, creating it empty if needed.
  fn open_or_create(&self, namespace: &str) -> RelayResult<GenerationHandle>;

  /// Look up one entry.
  fn get(&self, handle: &GenerationHandle, key: &ResourceKey) -> RelayResult<Option<ResourceEntry>>;

  /// Store one entry, replacing any previous entry at the same key.
  ///
  /// Fails if the namespace has been deleted.
  fn put(&self, handle: &GenerationHandle, key: &ResourceKey, entry: &ResourceEntry)
    -> RelayResult<()>;

  /// Create (or reuse) a namespace, write all `entries` and mark it complete,
  /// all in one transaction.
  fn seed(
    &self,
    namespace: &str,
    entries: &[(ResourceKey, ResourceEntry)],
  ) -> RelayResult<GenerationHandle>;

  /// Whether a namespace finished seeding.
  fn is_complete(&self, namespace: &str) -> RelayResult<bool>;

  fn list_namespaces(&self) -> RelayResult<BTreeSet<String>>;

  /// Delete a namespace and every entry it owns.
  fn delete_namespace(&self, namespace: &str) -> RelayResult<()>;

  /// Persisted active-generation pointer for a slot.
  fn active(&self, slot: Slot) -> RelayResult<Option<String>>;

  /// Persist active pointers for one or more slots in a single transaction.
  fn set_active(&self, pointers: &[(Slot, &str)]) -> RelayResult<()>;
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    complete INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    resource_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (namespace, resource_key),
    FOREIGN KEY (namespace) REFERENCES namespaces(name) ON DELETE CASCADE
);

-- One row per slot; activation is a single upsert
CREATE TABLE IF NOT EXISTS active_generations (
    slot TEXT PRIMARY KEY,
    namespace TEXT NOT NULL
);
"#;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  /// Open the cache database at `path`.
  pub fn open(path: &Path) -> RelayResult<Self> {
    Ok(Self {
      db: Database::open(path, CACHE_SCHEMA)?,
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> RelayResult<Self> {
    Ok(Self {
      db: Database::open_in_memory(CACHE_SCHEMA)?,
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn open_or_create(&self, namespace: &str) -> RelayResult<GenerationHandle> {
    let conn = self.db.conn()?;
    conn.execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![namespace],
    )?;
    Ok(GenerationHandle::new(namespace))
  }

  fn get(&self, handle: &GenerationHandle, key: &ResourceKey) -> RelayResult<Option<ResourceEntry>> {
    let conn = self.db.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE namespace = ? AND resource_key = ?",
        params![handle.namespace(), key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| RelayError::storage(format!("Failed to decode headers: {}", e)))?;
        Ok(Some(ResourceEntry {
          status,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    handle: &GenerationHandle,
    key: &ResourceKey,
    entry: &ResourceEntry,
  ) -> RelayResult<()> {
    let conn = self.db.conn()?;
    insert_entry(&conn, handle.namespace(), key, entry)
  }

  fn seed(
    &self,
    namespace: &str,
    entries: &[(ResourceKey, ResourceEntry)],
  ) -> RelayResult<GenerationHandle> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    tx.execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![namespace],
    )?;
    for (key, entry) in entries {
      insert_entry(&tx, namespace, key, entry)?;
    }
    tx.execute(
      "UPDATE namespaces SET complete = 1 WHERE name = ?",
      params![namespace],
    )?;

    tx.commit()?;
    Ok(GenerationHandle::new(namespace))
  }

  fn is_complete(&self, namespace: &str) -> RelayResult<bool> {
    let conn = self.db.conn()?;
    let complete: Option<bool> = conn
      .query_row(
        "SELECT complete FROM namespaces WHERE name = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()?;
    Ok(complete.unwrap_or(false))
  }

  fn list_namespaces(&self) -> RelayResult<BTreeSet<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM namespaces")?;
    let names = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(names)
  }

  fn delete_namespace(&self, namespace: &str) -> RelayResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE namespace = ?", params![namespace])?;
    tx.execute("DELETE FROM namespaces WHERE name = ?", params![namespace])?;
    tx.commit()?;
    Ok(())
  }

  fn active(&self, slot: Slot) -> RelayResult<Option<String>> {
    let conn = self.db.conn()?;
    let name = conn
      .query_row(
        "SELECT namespace FROM active_generations WHERE slot = ?",
        params![slot.as_str()],
        |row| row.get(0),
      )
      .optional()?;
    Ok(name)
  }

  fn set_active(&self, pointers: &[(Slot, &str)]) -> RelayResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;
    for (slot, namespace) in pointers {
      tx.execute(
        "INSERT OR REPLACE INTO active_generations (slot, namespace) VALUES (?, ?)",
        params![slot.as_str(), namespace],
      )?;
    }
    tx.commit()?;
    Ok(())
  }
}

fn insert_entry(
  conn: &rusqlite::Connection,
  namespace: &str,
  key: &ResourceKey,
  entry: &ResourceEntry,
) -> RelayResult<()> {
  let headers = serde_json::to_string(&entry.headers)
    .map_err(|e| RelayError::storage(format!("Failed to encode headers: {}", e)))?;

  conn.execute(
    "INSERT OR REPLACE INTO entries (namespace, resource_key, status, headers, body, stored_at)
     VALUES (?, ?, ?, ?, ?, ?)",
    params![
      namespace,
      key.as_str(),
      entry.status,
      headers,
      entry.body,
      entry.stored_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    ],
  )?;
  Ok(())
}

fn parse_datetime(s: &str) -> RelayResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| RelayError::storage(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(s: &str) -> ResourceKey {
    ResourceKey::from_raw(s)
  }

  fn entry(body: &str) -> ResourceEntry {
    ResourceEntry::new(
      200,
      vec![
        ("content-type".to_string(), "text/css".to_string()),
        ("etag".to_string(), "\"abc\"".to_string()),
      ],
      body.as_bytes().to_vec(),
    )
  }

  #[test]
  fn put_then_get_is_identical() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let handle = storage.open_or_create("assets-v1").unwrap();
    let original = entry("body { margin: 0 }");

    storage.put(&handle, &key("k1"), &original).unwrap();
    let loaded = storage.get(&handle, &key("k1")).unwrap().unwrap();

    assert_eq!(loaded, original);
  }

  #[test]
  fn put_replaces_whole_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let handle = storage.open_or_create("assets-v1").unwrap();

    storage.put(&handle, &key("k1"), &entry("old")).unwrap();
    let replacement = ResourceEntry::new(201, vec![], b"new".to_vec());
    storage.put(&handle, &key("k1"), &replacement).unwrap();

    assert_eq!(storage.get(&handle, &key("k1")).unwrap().unwrap(), replacement);
  }

  #[test]
  fn namespaces_are_isolated() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let v1 = storage.open_or_create("assets-v1").unwrap();
    let v2 = storage.open_or_create("assets-v2").unwrap();

    storage.put(&v1, &key("k"), &entry("one")).unwrap();
    assert!(storage.get(&v2, &key("k")).unwrap().is_none());
  }

  #[test]
  fn delete_namespace_drops_entries_and_rejects_writes() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let handle = storage.open_or_create("assets-v1").unwrap();
    storage.put(&handle, &key("k"), &entry("x")).unwrap();

    storage.delete_namespace("assets-v1").unwrap();

    assert!(storage.list_namespaces().unwrap().is_empty());
    assert!(storage.get(&handle, &key("k")).unwrap().is_none());
    let err = storage.put(&handle, &key("k"), &entry("late")).unwrap_err();
    assert!(matches!(err, RelayError::StorageUnavailable(_)));
  }

  #[test]
  fn seed_marks_complete_only_when_written() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_or_create("partial").unwrap();
    assert!(!storage.is_complete("partial").unwrap());

    storage
      .seed("seeded", &[(key("a"), entry("a")), (key("b"), entry("b"))])
      .unwrap();
    assert!(storage.is_complete("seeded").unwrap());
    assert!(!storage.is_complete("missing").unwrap());

    let handle = GenerationHandle::new("seeded");
    assert!(storage.get(&handle, &key("b")).unwrap().is_some());
  }

  #[test]
  fn active_pointer_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.open_or_create("assets-v1").unwrap();
      storage.set_active(&[(Slot::Assets, "assets-v1")]).unwrap();
      storage.set_active(&[(Slot::Assets, "assets-v2")]).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(
      storage.active(Slot::Assets).unwrap().as_deref(),
      Some("assets-v2")
    );
    assert_eq!(storage.active(Slot::Api).unwrap(), None);
  }

  #[test]
  fn failed_pointer_write_leaves_both_slots_unchanged() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .set_active(&[(Slot::Assets, "shop-v1"), (Slot::Api, "shop-api")])
      .unwrap();

    storage
      .db
      .conn()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_api BEFORE INSERT ON active_generations
         WHEN NEW.slot = 'api' BEGIN SELECT RAISE(ABORT, 'api pointer locked'); END;",
      )
      .unwrap();

    let err = storage
      .set_active(&[(Slot::Assets, "shop-v2"), (Slot::Api, "shop-api-2")])
      .unwrap_err();
    assert!(matches!(err, RelayError::StorageUnavailable(_)));
    assert_eq!(storage.active(Slot::Assets).unwrap().as_deref(), Some("shop-v1"));
    assert_eq!(storage.active(Slot::Api).unwrap().as_deref(), Some("shop-api"));
  }

  #[test]
  fn list_namespaces_returns_all() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_or_create("a").unwrap();
    storage.open_or_create("b").unwrap();
    storage.open_or_create("a").unwrap();

    let names: Vec<_> = storage.list_namespaces().unwrap().into_iter().collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
  }
}
