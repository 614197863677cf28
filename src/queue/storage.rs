//! Durable queue storage trait and SQLite implementation.
//!
//! Every operation runs under the connection lock and, where it touches
//! more than one row, inside a transaction. Two operations on the same
//! item can never interleave.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::types::{Attachment, NewWorkItem, Payload, Status, WorkId, WorkItem};
use crate::error::{StoreError, StoreResult};
use crate::registry::Action;

/// Aggregate queue counts for status badges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
  /// Items in `queued` or `failed`.
  pub pending: usize,
  /// Pending items the next automatic drain will attempt.
  pub retryable: usize,
  /// Pending items waiting on manual retry or discard.
  pub stalled: usize,
}

/// Trait for durable queue backends.
pub trait QueueStore: Send + Sync {
  /// Persist a new item in `queued` state and return its id.
  fn enqueue(&self, new: NewWorkItem) -> StoreResult<WorkId>;

  fn get(&self, id: WorkId) -> StoreResult<WorkItem>;

  /// Queued and failed items, oldest `created_at` first.
  fn list_pending(&self) -> StoreResult<Vec<WorkItem>>;

  /// Every stored item regardless of status, oldest first.
  fn list_all(&self) -> StoreResult<Vec<WorkItem>>;

  /// queued/failed -> syncing.
  fn mark_syncing(&self, id: WorkId) -> StoreResult<()>;

  /// syncing -> done. The row is deleted.
  fn mark_done(&self, id: WorkId) -> StoreResult<()>;

  /// syncing -> failed, incrementing `retry_count`. Returns the new count.
  fn mark_failed(&self, id: WorkId, error: &str) -> StoreResult<u32>;

  /// syncing -> failed with the permanent flag set. `retry_count` is untouched.
  fn mark_rejected(&self, id: WorkId, error: &str) -> StoreResult<()>;

  /// Clear the permanent flag on a pending item ahead of a manual retry.
  fn clear_permanent(&self, id: WorkId) -> StoreResult<()>;

  /// Delete a pending item on explicit user request.
  fn discard(&self, id: WorkId) -> StoreResult<()>;

  /// Return items claimed before `stale_before` and never settled to
  /// `queued`. Younger claims may still belong to a live dispatcher.
  fn recover_interrupted(&self, stale_before: DateTime<Utc>) -> StoreResult<usize>;

  fn counts(&self, max_retries: u32) -> StoreResult<QueueCounts>;

  fn set_meta(&self, name: &str, value: &str) -> StoreResult<()>;

  fn get_meta(&self, name: &str) -> StoreResult<Option<String>>;
}

/// SQLite-backed queue.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
  max_items: Option<usize>,
}

impl SqliteQueue {
  /// Open or create a queue database at `path`.
  pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {e}", parent.display())))?;
      }
    }

    let conn = Connection::open(path)?;
    // journal_mode returns the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    let queue = Self {
      conn: Mutex::new(conn),
      max_items: None,
    };
    queue.run_migrations()?;
    info!(path = %path.display(), "opened work queue");
    Ok(queue)
  }

  /// Create an in-memory queue (for testing).
  pub fn in_memory() -> StoreResult<Self> {
    let queue = Self {
      conn: Mutex::new(Connection::open_in_memory()?),
      max_items: None,
    };
    queue.run_migrations()?;
    Ok(queue)
  }

  /// Refuse to hold more than `limit` items.
  pub fn with_max_items(mut self, limit: Option<usize>) -> Self {
    self.max_items = limit;
    self
  }

  fn run_migrations(&self) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(QUEUE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

/// Schema for queue tables.
const QUEUE_SCHEMA: &str = r#"
-- seq breaks ties between items created in the same microsecond
CREATE TABLE IF NOT EXISTS work_items (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    action      TEXT NOT NULL,
    data        TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    status      TEXT NOT NULL DEFAULT 'queued',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    permanent   INTEGER NOT NULL DEFAULT 0,
    updated_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);
CREATE INDEX IF NOT EXISTS idx_work_items_created ON work_items(created_at, seq);

CREATE TABLE IF NOT EXISTS work_attachments (
    work_id      TEXT NOT NULL REFERENCES work_items(id) ON DELETE CASCADE,
    position     INTEGER NOT NULL,
    name         TEXT NOT NULL,
    content_type TEXT NOT NULL,
    bytes        BLOB NOT NULL,
    PRIMARY KEY (work_id, position)
);

CREATE TABLE IF NOT EXISTS sync_meta (
    name  TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SELECT_ITEM: &str = "SELECT id, action, data, created_at, status, retry_count, last_error, permanent, updated_at
   FROM work_items";

impl QueueStore for SqliteQueue {
  fn enqueue(&self, new: NewWorkItem) -> StoreResult<WorkId> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    if let Some(limit) = self.max_items {
      let count: i64 = tx.query_row("SELECT COUNT(*) FROM work_items", [], |row| row.get(0))?;
      if count as usize >= limit {
        return Err(StoreError::QuotaExceeded { limit });
      }
    }

    let id = WorkId::new();
    let now = Utc::now();
    let created_at = new.created_at.unwrap_or(now);
    let data = serde_json::to_string(&new.payload.data)?;

    tx.execute(
      "INSERT INTO work_items (id, action, data, created_at, status, retry_count, permanent, updated_at)
       VALUES (?1, ?2, ?3, ?4, 'queued', 0, 0, ?5)",
      params![
        id.to_string(),
        new.action.as_str(),
        data,
        created_at.timestamp_micros(),
        now.timestamp_micros(),
      ],
    )?;

    for (position, attachment) in new.payload.attachments.iter().enumerate() {
      tx.execute(
        "INSERT INTO work_attachments (work_id, position, name, content_type, bytes)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          id.to_string(),
          position as i64,
          attachment.name,
          attachment.content_type,
          attachment.bytes,
        ],
      )?;
    }

    tx.commit()?;
    info!(%id, action = %new.action, "enqueued work item");
    Ok(id)
  }

  fn get(&self, id: WorkId) -> StoreResult<WorkItem> {
    let conn = self.lock()?;
    get_item_on(&conn, id)
  }

  fn list_pending(&self) -> StoreResult<Vec<WorkItem>> {
    let conn = self.lock()?;
    let sql = format!(
      "{SELECT_ITEM} WHERE status IN ('queued', 'failed') ORDER BY created_at ASC, seq ASC"
    );
    list_on(&conn, &sql)
  }

  fn list_all(&self) -> StoreResult<Vec<WorkItem>> {
    let conn = self.lock()?;
    let sql = format!("{SELECT_ITEM} ORDER BY created_at ASC, seq ASC");
    list_on(&conn, &sql)
  }

  fn mark_syncing(&self, id: WorkId) -> StoreResult<()> {
    let conn = self.lock()?;
    let rows = conn.execute(
      "UPDATE work_items SET status = 'syncing', updated_at = ?1
       WHERE id = ?2 AND status IN ('queued', 'failed')",
      params![Utc::now().timestamp_micros(), id.to_string()],
    )?;
    ensure_transition(&conn, id, rows, Status::Syncing)?;
    debug!(%id, "work item syncing");
    Ok(())
  }

  fn mark_done(&self, id: WorkId) -> StoreResult<()> {
    let conn = self.lock()?;
    let rows = conn.execute(
      "DELETE FROM work_items WHERE id = ?1 AND status = 'syncing'",
      params![id.to_string()],
    )?;
    ensure_transition(&conn, id, rows, Status::Done)?;
    debug!(%id, "work item done");
    Ok(())
  }

  fn mark_failed(&self, id: WorkId, error: &str) -> StoreResult<u32> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    let rows = tx.execute(
      "UPDATE work_items
       SET status = 'failed', retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
       WHERE id = ?3 AND status = 'syncing'",
      params![error, Utc::now().timestamp_micros(), id.to_string()],
    )?;
    ensure_transition(&tx, id, rows, Status::Failed)?;
    let retry_count: u32 = tx.query_row(
      "SELECT retry_count FROM work_items WHERE id = ?1",
      params![id.to_string()],
      |row| row.get(0),
    )?;
    tx.commit()?;
    debug!(%id, retry_count, "work item failed");
    Ok(retry_count)
  }

  fn mark_rejected(&self, id: WorkId, error: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    let rows = conn.execute(
      "UPDATE work_items
       SET status = 'failed', permanent = 1, last_error = ?1, updated_at = ?2
       WHERE id = ?3 AND status = 'syncing'",
      params![error, Utc::now().timestamp_micros(), id.to_string()],
    )?;
    ensure_transition(&conn, id, rows, Status::Failed)?;
    debug!(%id, "work item rejected");
    Ok(())
  }

  fn clear_permanent(&self, id: WorkId) -> StoreResult<()> {
    let conn = self.lock()?;
    let rows = conn.execute(
      "UPDATE work_items SET permanent = 0, updated_at = ?1
       WHERE id = ?2 AND status IN ('queued', 'failed')",
      params![Utc::now().timestamp_micros(), id.to_string()],
    )?;
    ensure_transition(&conn, id, rows, Status::Queued)
  }

  fn discard(&self, id: WorkId) -> StoreResult<()> {
    let conn = self.lock()?;
    let rows = conn.execute(
      "DELETE FROM work_items WHERE id = ?1 AND status IN ('queued', 'failed')",
      params![id.to_string()],
    )?;
    ensure_transition(&conn, id, rows, Status::Done)?;
    info!(%id, "discarded work item");
    Ok(())
  }

  fn recover_interrupted(&self, stale_before: DateTime<Utc>) -> StoreResult<usize> {
    let conn = self.lock()?;
    let rows = conn.execute(
      "UPDATE work_items SET status = 'queued', updated_at = ?1
       WHERE status = 'syncing' AND updated_at < ?2",
      params![
        Utc::now().timestamp_micros(),
        stale_before.timestamp_micros()
      ],
    )?;
    if rows > 0 {
      info!(count = rows, "re-queued interrupted work items");
    }
    Ok(rows)
  }

  fn counts(&self, max_retries: u32) -> StoreResult<QueueCounts> {
    let conn = self.lock()?;
    let (pending, retryable): (i64, i64) = conn.query_row(
      "SELECT
         COUNT(*),
         COALESCE(SUM(CASE WHEN permanent = 0 AND retry_count < ?1 THEN 1 ELSE 0 END), 0)
       FROM work_items WHERE status IN ('queued', 'failed')",
      params![max_retries],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(QueueCounts {
      pending: pending as usize,
      retryable: retryable as usize,
      stalled: (pending - retryable) as usize,
    })
  }

  fn set_meta(&self, name: &str, value: &str) -> StoreResult<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO sync_meta (name, value) VALUES (?1, ?2)",
      params![name, value],
    )?;
    Ok(())
  }

  fn get_meta(&self, name: &str) -> StoreResult<Option<String>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM sync_meta WHERE name = ?1",
        params![name],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }
}

// ---------------------------------------------------------------------------
// Helpers that take &Connection so they run on a plain connection or a
// transaction alike.
// ---------------------------------------------------------------------------

/// Turn a zero-row update into NotFound or InvalidTransition.
fn ensure_transition(conn: &Connection, id: WorkId, rows: usize, to: Status) -> StoreResult<()> {
  if rows > 0 {
    return Ok(());
  }

  let current: Option<String> = conn
    .query_row(
      "SELECT status FROM work_items WHERE id = ?1",
      params![id.to_string()],
      |row| row.get(0),
    )
    .optional()?;

  match current {
    None => Err(StoreError::NotFound(id)),
    Some(status) => Err(StoreError::InvalidTransition {
      id,
      from: status.parse().map_err(StoreError::Corrupt)?,
      to,
    }),
  }
}

/// Raw column values for one work item row.
struct ItemRow {
  id: String,
  action: String,
  data: String,
  created_at: i64,
  status: String,
  retry_count: u32,
  last_error: Option<String>,
  permanent: bool,
  updated_at: i64,
}

impl ItemRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      action: row.get(1)?,
      data: row.get(2)?,
      created_at: row.get(3)?,
      status: row.get(4)?,
      retry_count: row.get(5)?,
      last_error: row.get(6)?,
      permanent: row.get(7)?,
      updated_at: row.get(8)?,
    })
  }

  fn into_work_item(self, attachments: Vec<Attachment>) -> StoreResult<WorkItem> {
    let id = self
      .id
      .parse()
      .map_err(|e| StoreError::Corrupt(format!("bad id {}: {e}", self.id)))?;

    Ok(WorkItem {
      id,
      action: Action::from_name(&self.action),
      payload: Payload {
        data: serde_json::from_str(&self.data)?,
        attachments,
      },
      created_at: from_micros(self.created_at)?,
      status: self.status.parse().map_err(StoreError::Corrupt)?,
      retry_count: self.retry_count,
      last_error: self.last_error,
      permanent: self.permanent,
      updated_at: from_micros(self.updated_at)?,
    })
  }
}

fn from_micros(micros: i64) -> StoreResult<DateTime<Utc>> {
  DateTime::from_timestamp_micros(micros)
    .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {micros}")))
}

fn attachments_on(conn: &Connection, id: &str) -> StoreResult<Vec<Attachment>> {
  let mut stmt = conn.prepare(
    "SELECT name, content_type, bytes FROM work_attachments
     WHERE work_id = ?1 ORDER BY position",
  )?;
  let attachments = stmt
    .query_map(params![id], |row| {
      Ok(Attachment {
        name: row.get(0)?,
        content_type: row.get(1)?,
        bytes: row.get(2)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(attachments)
}

fn get_item_on(conn: &Connection, id: WorkId) -> StoreResult<WorkItem> {
  let sql = format!("{SELECT_ITEM} WHERE id = ?1");
  let row = conn
    .query_row(&sql, params![id.to_string()], ItemRow::from_row)
    .optional()?
    .ok_or(StoreError::NotFound(id))?;
  let attachments = attachments_on(conn, &row.id)?;
  row.into_work_item(attachments)
}

fn list_on(conn: &Connection, sql: &str) -> StoreResult<Vec<WorkItem>> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt
    .query_map([], ItemRow::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut items = Vec::with_capacity(rows.len());
  for row in rows {
    let attachments = attachments_on(conn, &row.id)?;
    items.push(row.into_work_item(attachments)?);
  }
  Ok(items)
}
