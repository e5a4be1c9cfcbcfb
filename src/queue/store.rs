//! Persistence adapter for queue entries.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, Row};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::api::{Method, Operation};
use crate::db;
use crate::lock::lock;

use super::entry::{EntryId, QueueEntry};

/// Trait for queue storage backends.
///
/// Calls are synchronous and short; the queue never holds a store call across
/// a network request.
pub trait QueueStore: Send + Sync {
  /// All entries, in no particular order.
  fn get_all(&self) -> Result<Vec<QueueEntry>>;

  /// Insert a new entry. Fails if the id already exists.
  fn put(&self, entry: &QueueEntry) -> Result<()>;

  /// Replace an existing entry.
  fn update(&self, entry: &QueueEntry) -> Result<()>;

  /// Remove an entry. Removing a missing entry is not an error.
  fn delete(&self, id: &EntryId) -> Result<()>;

  /// Whether entries written now will survive a restart.
  fn is_durable(&self) -> bool {
    true
  }
}

/// Process-local store. Entries are lost when the process exits.
#[derive(Default)]
pub struct MemoryQueueStore {
  entries: Mutex<BTreeMap<EntryId, QueueEntry>>,
}

impl MemoryQueueStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl QueueStore for MemoryQueueStore {
  fn get_all(&self) -> Result<Vec<QueueEntry>> {
    Ok(lock(&self.entries).values().cloned().collect())
  }

  fn put(&self, entry: &QueueEntry) -> Result<()> {
    let mut entries = lock(&self.entries);
    if entries.contains_key(&entry.id) {
      return Err(eyre!("Queue entry {} already exists", entry.id));
    }
    entries.insert(entry.id, entry.clone());
    Ok(())
  }

  fn update(&self, entry: &QueueEntry) -> Result<()> {
    match lock(&self.entries).get_mut(&entry.id) {
      Some(existing) => {
        *existing = entry.clone();
        Ok(())
      }
      None => Err(eyre!("Queue entry {} not found", entry.id)),
    }
  }

  fn delete(&self, id: &EntryId) -> Result<()> {
    lock(&self.entries).remove(id);
    Ok(())
  }

  fn is_durable(&self) -> bool {
    false
  }
}

/// SQLite-backed queue storage. Survives restarts.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

impl SqliteQueueStore {
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, db::schema::QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = db::open_in_memory(db::schema::QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl QueueStore for SqliteQueueStore {
  fn get_all(&self) -> Result<Vec<QueueEntry>> {
    let mut conn = self.conn()?;
    let mut entries = Vec::new();
    let mut unreadable = Vec::new();
    {
      let mut stmt = conn
        .prepare(
          "SELECT id, path, method, body, headers, resources, attempts, next_eligible_at, created_at, last_error
           FROM mutation_queue
           ORDER BY created_at, id",
        )
        .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

      let rows = stmt
        .query_map([], read_row)
        .map_err(|e| eyre!("Failed to query queue: {}", e))?;

      for row in rows {
        let raw = row.map_err(|e| eyre!("Failed to read queue row: {}", e))?;
        let id = raw.id.clone();
        match raw.into_entry() {
          Ok(entry) => entries.push(entry),
          Err(e) => unreadable.push((id, e.to_string())),
        }
      }
    }

    // One corrupt row must not block every other pending write.
    for (id, reason) in unreadable {
      match move_to_dead_letters(&mut conn, &id, &reason) {
        Ok(()) => error!(%id, %reason, "unreadable queue entry moved to mutation_queue_dead"),
        Err(e) => warn!(%id, %reason, error = %e, "skipping unreadable queue entry"),
      }
    }
    Ok(entries)
  }

  fn put(&self, entry: &QueueEntry) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO mutation_queue (id, path, method, body, headers, resources, attempts, next_eligible_at, created_at, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          entry.id.to_string(),
          entry.operation.path,
          entry.operation.method.as_str(),
          entry.operation.body,
          entry.operation.headers_json(),
          resources_json(&entry.resources)?,
          entry.attempts,
          format_datetime(&entry.next_eligible_at),
          format_datetime(&entry.created_at),
          entry.last_error,
        ],
      )
      .map_err(|e| eyre!("Failed to store queue entry {}: {}", entry.id, e))?;
    Ok(())
  }

  fn update(&self, entry: &QueueEntry) -> Result<()> {
    let conn = self.conn()?;
    let changed = conn
      .execute(
        "UPDATE mutation_queue
         SET attempts = ?, next_eligible_at = ?, last_error = ?
         WHERE id = ?",
        params![
          entry.attempts,
          format_datetime(&entry.next_eligible_at),
          entry.last_error,
          entry.id.to_string(),
        ],
      )
      .map_err(|e| eyre!("Failed to update queue entry {}: {}", entry.id, e))?;

    if changed == 0 {
      return Err(eyre!("Queue entry {} not found", entry.id));
    }
    Ok(())
  }

  fn delete(&self, id: &EntryId) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM mutation_queue WHERE id = ?",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to delete queue entry {}: {}", id, e))?;
    Ok(())
  }
}

fn move_to_dead_letters(conn: &mut Connection, id: &str, reason: &str) -> Result<()> {
  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to start transaction: {}", e))?;
  tx.execute(
    "INSERT INTO mutation_queue_dead
     SELECT id, path, method, body, headers, resources, attempts, next_eligible_at, created_at, last_error, ?, ?
     FROM mutation_queue WHERE id = ?",
    params![reason, format_datetime(&Utc::now()), id],
  )
  .map_err(|e| eyre!("Failed to copy queue entry {}: {}", id, e))?;
  tx.execute("DELETE FROM mutation_queue WHERE id = ?", params![id])
    .map_err(|e| eyre!("Failed to delete queue entry {}: {}", id, e))?;
  tx.commit()
    .map_err(|e| eyre!("Failed to commit dead letter for {}: {}", id, e))
}

struct RawRow {
  id: String,
  path: String,
  method: String,
  body: Option<String>,
  headers: String,
  resources: String,
  attempts: u32,
  next_eligible_at: String,
  created_at: String,
  last_error: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
  Ok(RawRow {
    id: row.get(0)?,
    path: row.get(1)?,
    method: row.get(2)?,
    body: row.get(3)?,
    headers: row.get(4)?,
    resources: row.get(5)?,
    attempts: row.get(6)?,
    next_eligible_at: row.get(7)?,
    created_at: row.get(8)?,
    last_error: row.get(9)?,
  })
}

impl RawRow {
  fn into_entry(self) -> Result<QueueEntry> {
    let id: EntryId = self
      .id
      .parse()
      .map_err(|e| eyre!("Invalid queue entry id '{}': {}", self.id, e))?;
    let method = self.method.parse::<Method>().map_err(|e| eyre!("{}", e))?;
    let headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Invalid headers for {}: {}", id, e))?;
    let resources = serde_json::from_str(&self.resources)
      .map_err(|e| eyre!("Invalid resources for {}: {}", id, e))?;

    Ok(QueueEntry {
      id,
      operation: Operation {
        path: self.path,
        method,
        body: self.body,
        headers,
      },
      resources,
      attempts: self.attempts,
      next_eligible_at: parse_datetime(&self.next_eligible_at)?,
      created_at: parse_datetime(&self.created_at)?,
      last_error: self.last_error,
    })
  }
}

fn resources_json(resources: &[String]) -> Result<String> {
  serde_json::to_string(resources).map_err(|e| eyre!("Failed to serialize resources: {}", e))
}

/// Fixed-width RFC 3339 so textual order matches chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Write-through store: a durable backend mirrored by an in-memory copy.
///
/// When the durable backend fails (or was never available) new entries stay in
/// memory for the rest of the session instead of failing the caller. Entries
/// already stored durably keep getting their updates and deletes written
/// through, so a delivered entry is not replayed after a restart.
pub struct ResilientStore {
  durable: Option<Box<dyn QueueStore>>,
  memory: MemoryQueueStore,
  degraded: AtomicBool,
  /// Ids with a row in the durable store
  persisted: Mutex<HashSet<EntryId>>,
}

impl ResilientStore {
  pub fn new(durable: Box<dyn QueueStore>) -> Self {
    let memory = MemoryQueueStore::new();
    let mut persisted = HashSet::new();
    let degraded = match durable.get_all() {
      Ok(entries) => {
        for entry in &entries {
          // Ids are unique in the durable table, so this cannot collide.
          let _ = memory.put(entry);
          persisted.insert(entry.id);
        }
        if !entries.is_empty() {
          info!(count = entries.len(), "restored pending mutations");
        }
        false
      }
      Err(e) => {
        warn!(error = %e, "durable queue unreadable, using memory for this session");
        true
      }
    };

    Self {
      durable: Some(durable),
      memory,
      degraded: AtomicBool::new(degraded),
      persisted: Mutex::new(persisted),
    }
  }

  pub fn memory_only() -> Self {
    Self {
      durable: None,
      memory: MemoryQueueStore::new(),
      degraded: AtomicBool::new(true),
      persisted: Mutex::new(HashSet::new()),
    }
  }

  /// Open the SQLite queue at `path`, or fall back to memory if it cannot be opened.
  pub fn open(path: &Path) -> Self {
    match SqliteQueueStore::open(path) {
      Ok(store) => Self::new(Box::new(store)),
      Err(e) => {
        warn!(error = %e, path = %path.display(), "queue database unavailable, pending writes will not survive a restart");
        Self::memory_only()
      }
    }
  }

  /// Run `f` against the durable store. A failure stops new entries from
  /// being written durably; it never fails the caller.
  fn write_through(&self, op: &str, f: impl FnOnce(&dyn QueueStore) -> Result<()>) -> bool {
    let Some(durable) = &self.durable else {
      return false;
    };
    match f(durable.as_ref()) {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, op, "durable queue write failed, continuing in memory");
        self.degraded.store(true, Ordering::SeqCst);
        false
      }
    }
  }

  fn is_persisted(&self, id: &EntryId) -> bool {
    lock(&self.persisted).contains(id)
  }
}

impl QueueStore for ResilientStore {
  fn get_all(&self) -> Result<Vec<QueueEntry>> {
    self.memory.get_all()
  }

  fn put(&self, entry: &QueueEntry) -> Result<()> {
    self.memory.put(entry)?;
    if self.is_durable() && self.write_through("put", |d| d.put(entry)) {
      lock(&self.persisted).insert(entry.id);
    }
    Ok(())
  }

  fn update(&self, entry: &QueueEntry) -> Result<()> {
    self.memory.update(entry)?;
    if self.is_persisted(&entry.id) {
      self.write_through("update", |d| d.update(entry));
    }
    Ok(())
  }

  fn delete(&self, id: &EntryId) -> Result<()> {
    self.memory.delete(id)?;
    if self.is_persisted(id) && self.write_through("delete", |d| d.delete(id)) {
      lock(&self.persisted).remove(id);
    }
    Ok(())
  }

  fn is_durable(&self) -> bool {
    !self.degraded.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::SubsecRound;
  use serde_json::json;

  fn sample(path: &str) -> QueueEntry {
    QueueEntry::new(
      Operation::new(Method::Post, path).with_json(&json!({"name": "Fern"})),
      vec!["/api/v1/plants/".to_string()],
      // The database keeps microsecond precision.
      Utc::now().trunc_subsecs(6),
    )
  }

  /// Durable store whose every call fails.
  struct BrokenStore;

  impl QueueStore for BrokenStore {
    fn get_all(&self) -> Result<Vec<QueueEntry>> {
      Err(eyre!("disk gone"))
    }
    fn put(&self, _entry: &QueueEntry) -> Result<()> {
      Err(eyre!("disk gone"))
    }
    fn update(&self, _entry: &QueueEntry) -> Result<()> {
      Err(eyre!("disk gone"))
    }
    fn delete(&self, _id: &EntryId) -> Result<()> {
      Err(eyre!("disk gone"))
    }
  }

  fn exercise(store: &dyn QueueStore) {
    let mut entry = sample("/api/v1/plants/");
    store.put(&entry).unwrap();
    assert!(store.put(&entry).is_err());

    entry.attempts = 2;
    entry.last_error = Some("server error 503".into());
    store.update(&entry).unwrap();

    let all = store.get_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0], entry);

    store.delete(&entry.id).unwrap();
    store.delete(&entry.id).unwrap();
    assert!(store.get_all().unwrap().is_empty());
    assert!(store.update(&entry).is_err());
  }

  #[test]
  fn test_memory_store_contract() {
    exercise(&MemoryQueueStore::new());
  }

  #[test]
  fn test_sqlite_store_contract() {
    exercise(&SqliteQueueStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let entry = sample("/api/v1/villages/");

    {
      let store = SqliteQueueStore::open(&path).unwrap();
      store.put(&entry).unwrap();
    }

    let reopened = SqliteQueueStore::open(&path).unwrap();
    assert_eq!(reopened.get_all().unwrap(), vec![entry]);
  }

  #[test]
  fn test_resilient_store_restores_and_writes_through() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let first = sample("/api/v1/villages/");

    {
      let store = ResilientStore::open(&path);
      assert!(store.is_durable());
      store.put(&first).unwrap();
    }

    let store = ResilientStore::open(&path);
    assert_eq!(store.get_all().unwrap(), vec![first.clone()]);
    store.delete(&first.id).unwrap();

    let reopened = SqliteQueueStore::open(&path).unwrap();
    assert!(reopened.get_all().unwrap().is_empty());
  }

  #[test]
  fn test_resilient_store_degrades_instead_of_failing() {
    let store = ResilientStore::new(Box::new(BrokenStore));
    assert!(!store.is_durable());
    exercise(&store);
  }

  #[test]
  fn test_resilient_store_degrades_on_write_failure() {
    struct FailingWrites(MemoryQueueStore);

    impl QueueStore for FailingWrites {
      fn get_all(&self) -> Result<Vec<QueueEntry>> {
        self.0.get_all()
      }
      fn put(&self, _entry: &QueueEntry) -> Result<()> {
        Err(eyre!("database is locked"))
      }
      fn update(&self, entry: &QueueEntry) -> Result<()> {
        self.0.update(entry)
      }
      fn delete(&self, id: &EntryId) -> Result<()> {
        self.0.delete(id)
      }
    }

    let store = ResilientStore::new(Box::new(FailingWrites(MemoryQueueStore::new())));
    assert!(store.is_durable());

    let entry = sample("/api/v1/plants/");
    store.put(&entry).unwrap();
    assert!(!store.is_durable());
    assert_eq!(store.get_all().unwrap().len(), 1);
  }

  /// SQLite store whose `put` fails on the given call, like a momentary lock.
  struct FlakyPut {
    inner: SqliteQueueStore,
    calls: Mutex<u32>,
    fail_on: u32,
  }

  impl QueueStore for FlakyPut {
    fn get_all(&self) -> Result<Vec<QueueEntry>> {
      self.inner.get_all()
    }
    fn put(&self, entry: &QueueEntry) -> Result<()> {
      let mut calls = lock(&self.calls);
      *calls += 1;
      if *calls == self.fail_on {
        return Err(eyre!("database is locked"));
      }
      self.inner.put(entry)
    }
    fn update(&self, entry: &QueueEntry) -> Result<()> {
      self.inner.update(entry)
    }
    fn delete(&self, id: &EntryId) -> Result<()> {
      self.inner.delete(id)
    }
  }

  #[test]
  fn test_delivered_entry_stays_deleted_after_degrading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let mut kept = sample("/a");
    let delivered = sample("/b");
    let unsaved = sample("/c");

    {
      let store = ResilientStore::new(Box::new(FlakyPut {
        inner: SqliteQueueStore::open(&path).unwrap(),
        calls: Mutex::new(0),
        fail_on: 3,
      }));
      store.put(&kept).unwrap();
      store.put(&delivered).unwrap();
      store.put(&unsaved).unwrap();
      assert!(!store.is_durable());

      store.delete(&delivered.id).unwrap();
      kept.attempts = 3;
      kept.last_error = Some("server error 502".into());
      store.update(&kept).unwrap();
      store.delete(&unsaved.id).unwrap();
    }

    let reopened = ResilientStore::open(&path);
    assert_eq!(reopened.get_all().unwrap(), vec![kept]);
  }

  #[test]
  fn test_unreadable_rows_move_to_dead_letters() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let good = sample("/api/v1/villages/");
    store.put(&good).unwrap();
    store
      .conn()
      .unwrap()
      .execute(
        "INSERT INTO mutation_queue (id, path, method, next_eligible_at, created_at)
         VALUES ('not-a-uuid', '/x', 'BREW', '2024-01-01T00:00:00.000000Z', '2024-01-01T00:00:00.000000Z')",
        [],
      )
      .unwrap();

    assert_eq!(store.get_all().unwrap(), vec![good.clone()]);
    assert_eq!(store.get_all().unwrap(), vec![good]);

    let conn = store.conn().unwrap();
    let count = |table: &str| -> i64 {
      conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .unwrap()
    };
    assert_eq!(count("mutation_queue"), 1);
    assert_eq!(count("mutation_queue_dead"), 1);
    let reason: String = conn
      .query_row("SELECT reason FROM mutation_queue_dead", [], |r| r.get(0))
      .unwrap();
    assert!(reason.contains("not-a-uuid"));
  }
}
