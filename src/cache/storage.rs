//! Cache storage trait and SQLite implementation.
//!
//! Entries are keyed by `(generation, key)`. Which generation is current
//! lives in `cache_meta`, so an activation survives restarts.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::traits::CachedResponse;

const CURRENT_GENERATION: &str = "current_generation";

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  /// When the entry was cached
  pub cached_at: DateTime<Utc>,
}

/// One response to store, with the request it answers.
#[derive(Debug, Clone)]
pub struct NewEntry {
  pub key: String,
  pub url: String,
  pub response: CachedResponse,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get an entry of `generation`.
  fn get(&self, generation: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store (or replace) one entry of `generation`.
  fn put(&self, generation: &str, entry: &NewEntry) -> Result<()>;

  /// Store a batch of entries in one transaction.
  fn put_all(&self, generation: &str, entries: &[NewEntry]) -> Result<()>;

  /// The generation recorded by the last activation.
  fn current_generation(&self) -> Result<Option<String>>;

  /// Record `generation` as current and delete every other generation, in
  /// one transaction. Returns the number of purged entries.
  fn activate(&self, generation: &str) -> Result<usize>;

  /// Delete entries of every generation except `keep`.
  fn purge_except(&self, keep: &str) -> Result<usize>;

  /// Entry count per generation.
  fn generations(&self) -> Result<Vec<(String, usize)>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, cache_key)
);

CREATE TABLE IF NOT EXISTS cache_meta (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const INSERT_ENTRY: &str =
  "INSERT OR REPLACE INTO cache_entries (generation, cache_key, url, status, content_type, body, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, datetime('now'))";

impl CacheStorage for SqliteStorage {
  fn get(&self, generation: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.lock()?;

    let row: Option<(u16, Option<String>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, content_type, body, cached_at FROM cache_entries
         WHERE generation = ? AND cache_key = ?",
        params![generation, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, content_type, body, cached_at_str)) => Ok(Some(CachedEntry {
        response: CachedResponse {
          status,
          content_type,
          body,
        },
        cached_at: parse_datetime(&cached_at_str)?,
      })),
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, entry: &NewEntry) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        INSERT_ENTRY,
        params![
          generation,
          entry.key,
          entry.url,
          entry.response.status,
          entry.response.content_type,
          entry.response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
    debug!(generation, url = %entry.url, "cached response");
    Ok(())
  }

  fn put_all(&self, generation: &str, entries: &[NewEntry]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entry in entries {
      tx.execute(
        INSERT_ENTRY,
        params![
          generation,
          entry.key,
          entry.url,
          entry.response.status,
          entry.response.content_type,
          entry.response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.url, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn current_generation(&self) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT value FROM cache_meta WHERE name = ?",
        params![CURRENT_GENERATION],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read current generation: {}", e))
  }

  fn activate(&self, generation: &str) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_meta (name, value) VALUES (?, ?)",
      params![CURRENT_GENERATION, generation],
    )
    .map_err(|e| eyre!("Failed to record current generation: {}", e))?;
    let purged = tx
      .execute(
        "DELETE FROM cache_entries WHERE generation != ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to purge old generations: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    info!(generation, purged, "activated cache generation");
    Ok(purged)
  }

  fn purge_except(&self, keep: &str) -> Result<usize> {
    let purged = self
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE generation != ?",
        params![keep],
      )
      .map_err(|e| eyre!("Failed to purge cache entries: {}", e))?;
    if purged > 0 {
      info!(keep, purged, "purged stale cache entries");
    }
    Ok(purged)
  }

  fn generations(&self) -> Result<Vec<(String, usize)>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT generation, COUNT(*) FROM cache_entries
         GROUP BY generation ORDER BY generation",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to query generations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read generations: {}", e))?;
    Ok(
      rows
        .into_iter()
        .map(|(generation, count)| (generation, count as usize))
        .collect(),
    )
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(key: &str, body: &str) -> NewEntry {
    NewEntry {
      key: key.to_string(),
      url: format!("https://pm.example.com/{key}"),
      response: CachedResponse::new(200, Some("text/plain"), body.as_bytes()),
    }
  }

  #[test]
  fn test_put_then_get() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.put("v1", &entry("a", "alpha")).unwrap();

    let cached = storage.get("v1", "a").unwrap().unwrap();
    assert_eq!(cached.response.body, b"alpha");
    assert_eq!(cached.response.content_type.as_deref(), Some("text/plain"));
    assert!(storage.get("v2", "a").unwrap().is_none());
    assert!(storage.get("v1", "b").unwrap().is_none());
  }

  #[test]
  fn test_activate_purges_other_generations() {
    let storage = SqliteStorage::in_memory().unwrap();
    assert_eq!(storage.current_generation().unwrap(), None);

    storage.put("v1", &entry("a", "old")).unwrap();
    storage.put("v1", &entry("b", "old")).unwrap();
    storage
      .put_all("v2", &[entry("a", "new"), entry("c", "new")])
      .unwrap();

    assert_eq!(storage.activate("v2").unwrap(), 2);
    assert_eq!(storage.current_generation().unwrap().as_deref(), Some("v2"));
    assert_eq!(storage.generations().unwrap(), vec![("v2".to_string(), 2)]);
    assert_eq!(storage.get("v2", "a").unwrap().unwrap().response.body, b"new");
  }

  #[test]
  fn test_purge_except_keeps_current() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.put("v1", &entry("a", "x")).unwrap();
    storage.put("v0", &entry("a", "y")).unwrap();

    assert_eq!(storage.purge_except("v1").unwrap(), 1);
    assert!(storage.get("v1", "a").unwrap().is_some());
    assert_eq!(storage.purge_except("v1").unwrap(), 0);
  }

  #[test]
  fn test_activation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("v3", &entry("a", "x")).unwrap();
      storage.activate("v3").unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.current_generation().unwrap().as_deref(), Some("v3"));
    assert!(storage.get("v3", "a").unwrap().is_some());
  }
}
