//! Cache storage trait and its implementations.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::db;
use crate::lock::lock;

use super::traits::{CacheEntry, RequestKey};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Insert or replace the entry for `entry.key`.
  fn put(&self, entry: &CacheEntry) -> Result<()>;

  /// Drop every entry.
  fn clear(&self) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// Process-local cache, used when the cache database cannot be opened.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<RequestKey, CacheEntry>>,
}

impl CacheStorage for MemoryStorage {
  fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(lock(&self.entries).get(key).cloned())
  }

  fn put(&self, entry: &CacheEntry) -> Result<()> {
    lock(&self.entries).insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    lock(&self.entries).clear();
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, db::schema::CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = db::open_in_memory(db::schema::CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(Option<String>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT token, payload, cached_at FROM http_cache WHERE key_hash = ?",
        params![key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((token, payload, cached_at)) => {
        let payload = serde_json::from_slice(&payload)
          .map_err(|e| eyre!("Failed to deserialize cached payload: {}", e))?;
        Ok(Some(CacheEntry {
          key: key.clone(),
          token,
          payload,
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, entry: &CacheEntry) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let payload =
      serde_json::to_vec(&entry.payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO http_cache (key_hash, request_key, token, payload, cached_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          entry.key.cache_hash(),
          entry.key.identity(),
          entry.token,
          payload,
          entry.cached_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute("DELETE FROM http_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::SubsecRound;
  use serde_json::json;

  fn entry(url: &str, token: &str) -> CacheEntry {
    CacheEntry {
      key: RequestKey::get(url),
      token: Some(token.to_string()),
      payload: json!([{"id": "v1", "name": "Harbor"}]),
      cached_at: Utc::now().trunc_subsecs(6),
    }
  }

  fn exercise(storage: &dyn CacheStorage) {
    let first = entry("http://h/api/v1/villages/", "abc");
    assert_eq!(storage.get(&first.key).unwrap(), None);

    storage.put(&first).unwrap();
    assert_eq!(storage.get(&first.key).unwrap(), Some(first.clone()));

    let replaced = CacheEntry {
      token: Some("def".into()),
      payload: json!([]),
      ..first.clone()
    };
    storage.put(&replaced).unwrap();
    assert_eq!(storage.get(&first.key).unwrap(), Some(replaced));

    storage.clear().unwrap();
    assert_eq!(storage.get(&first.key).unwrap(), None);
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::default());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_noop_storage_never_hits() {
    let storage = NoopStorage;
    let e = entry("http://h/api/v1/plants/", "t");
    storage.put(&e).unwrap();
    assert_eq!(storage.get(&e.key).unwrap(), None);
  }
}
