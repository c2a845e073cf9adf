//! Durable FIFO of pending mutating operations.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{RelayError, RelayResult};

/// A mutation waiting for server-confirmed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
  pub id: String,
  /// Opaque request body, e.g. a serialized payment intent
  pub payload: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub last_error: Option<String>,
}

impl PendingOperation {
  /// A fresh operation with a newly generated id.
  pub fn new(payload: Vec<u8>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      payload,
      created_at: Utc::now(),
      attempt_count: 0,
      last_error: None,
    }
  }
}

/// A stored row that could not be decoded.
#[derive(Debug)]
pub(super) struct CorruptRow {
  pub seq: i64,
  pub error: RelayError,
}

const QUEUE_SCHEMA: &str = r#"
-- seq preserves enqueue order across restarts
CREATE TABLE IF NOT EXISTS pending_operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    data BLOB NOT NULL
);

-- At most one drain pass per queue file, across processes
CREATE TABLE IF NOT EXISTS drain_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

/// How long a drain lease stays valid without renewal. A pass renews it after
/// every operation, so this only needs to cover one submission.
const LEASE_TTL_SECS: i64 = 60;

/// Retry queue persisted in its own SQLite database.
pub struct RetryQueue {
  db: Database,
  /// Identifies this handle as a lease holder
  owner: String,
  pub(super) draining: AtomicBool,
}

impl RetryQueue {
  pub fn open(path: &Path) -> RelayResult<Self> {
    Ok(Self::with_db(Database::open(path, QUEUE_SCHEMA)?))
  }

  #[cfg(test)]
  pub fn open_in_memory() -> RelayResult<Self> {
    Ok(Self::with_db(Database::open_in_memory(QUEUE_SCHEMA)?))
  }

  fn with_db(db: Database) -> Self {
    Self {
      db,
      owner: Uuid::new_v4().to_string(),
      draining: AtomicBool::new(false),
    }
  }

  /// Persist a new operation at the tail of the queue.
  pub fn enqueue(&self, payload: Vec<u8>) -> RelayResult<String> {
    self.push(PendingOperation::new(payload))
  }

  /// Persist an already-built operation at the tail, keeping its id.
  pub fn push(&self, operation: PendingOperation) -> RelayResult<String> {
    let data = encode(&operation)?;

    let conn = self.db.conn()?;
    conn.execute(
      "INSERT INTO pending_operations (id, data) VALUES (?, ?)",
      params![operation.id, data],
    )?;

    debug!(id = %operation.id, bytes = operation.payload.len(), "Enqueued operation");
    Ok(operation.id)
  }

  /// All decodable operations in FIFO order. Corrupt rows are skipped.
  pub fn peek_all(&self) -> RelayResult<Vec<PendingOperation>> {
    let rows = self.scan()?;
    Ok(
      rows
        .into_iter()
        .filter_map(|row| match row {
          Ok(op) => Some(op),
          Err(corrupt) => {
            warn!(seq = corrupt.seq, error = %corrupt.error, "Skipping corrupt queue row");
            None
          }
        })
        .collect(),
    )
  }

  #[cfg(test)]
  pub fn len(&self) -> RelayResult<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| {
      row.get(0)
    })?;
    Ok(count as usize)
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> RelayResult<bool> {
    Ok(self.len()? == 0)
  }

  /// Every row in FIFO order, decoded or flagged corrupt.
  pub(super) fn scan(&self) -> RelayResult<Vec<Result<PendingOperation, CorruptRow>>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare("SELECT seq, id, data FROM pending_operations ORDER BY seq")?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Vec<u8>>(2)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(
      rows
        .into_iter()
        .map(|(seq, id, data)| {
          serde_json::from_slice::<PendingOperation>(&data).map_err(|e| CorruptRow {
            seq,
            error: RelayError::QueueCorrupt {
              id,
              reason: e.to_string(),
            },
          })
        })
        .collect(),
    )
  }

  /// Remove an operation after confirmed delivery.
  pub(super) fn remove(&self, id: &str) -> RelayResult<()> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM pending_operations WHERE id = ?", params![id])?;
    Ok(())
  }

  pub(super) fn remove_seq(&self, seq: i64) -> RelayResult<()> {
    let conn = self.db.conn()?;
    conn.execute("DELETE FROM pending_operations WHERE seq = ?", params![seq])?;
    Ok(())
  }

  /// Rewrite an operation in place after a failed attempt. Its position is
  /// unchanged.
  pub(super) fn record_failure(&self, operation: &mut PendingOperation, error: &RelayError) -> RelayResult<()> {
    operation.attempt_count = operation.attempt_count.saturating_add(1);
    operation.last_error = Some(error.to_string());
    let data = encode(operation)?;

    let conn = self.db.conn()?;
    conn.execute(
      "UPDATE pending_operations SET data = ? WHERE id = ?",
      params![data, operation.id],
    )?;
    Ok(())
  }

  /// Claim or renew the drain lease. Returns `false` if another handle holds
  /// an unexpired lease.
  pub(super) fn acquire_lease(&self) -> RelayResult<bool> {
    let now = Utc::now();
    let expires_at = (now + Duration::seconds(LEASE_TTL_SECS)).timestamp_millis();

    let mut conn = self.db.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let holder: Option<(String, i64)> = tx
      .query_row(
        "SELECT owner, expires_at FROM drain_lease WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    if let Some((owner, held_until)) = holder {
      if owner != self.owner && held_until > now.timestamp_millis() {
        debug!(%owner, "Drain lease held elsewhere");
        return Ok(false);
      }
      if owner != self.owner {
        warn!(%owner, "Taking over expired drain lease");
      }
    }

    tx.execute(
      "INSERT OR REPLACE INTO drain_lease (id, owner, expires_at) VALUES (1, ?, ?)",
      params![self.owner, expires_at],
    )?;
    tx.commit()?;
    Ok(true)
  }

  /// Give up the drain lease if this handle still holds it.
  pub(super) fn release_lease(&self) -> RelayResult<()> {
    let conn = self.db.conn()?;
    conn.execute(
      "DELETE FROM drain_lease WHERE id = 1 AND owner = ?",
      params![self.owner],
    )?;
    Ok(())
  }

  #[cfg(test)]
  pub(super) fn insert_lease(&self, owner: &str, expires_at: DateTime<Utc>) {
    let conn = self.db.conn().unwrap();
    conn
      .execute(
        "INSERT OR REPLACE INTO drain_lease (id, owner, expires_at) VALUES (1, ?, ?)",
        params![owner, expires_at.timestamp_millis()],
      )
      .unwrap();
  }

  #[cfg(test)]
  pub(super) fn insert_raw(&self, id: &str, data: &[u8]) {
    let conn = self.db.conn().unwrap();
    conn
      .execute(
        "INSERT INTO pending_operations (id, data) VALUES (?, ?)",
        params![id, data],
      )
      .unwrap();
  }
}

fn encode(operation: &PendingOperation) -> RelayResult<Vec<u8>> {
  serde_json::to_vec(operation)
    .map_err(|e| RelayError::storage(format!("Failed to serialize operation: {}", e)))
}
