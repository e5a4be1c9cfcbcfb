//! Local application state keyed by resource.
//!
//! Values are the JSON representations last read from (or provisionally written
//! for) a resource path. Each key also carries a count of unsynced mutations,
//! which views use to show a "pending sync" marker.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::bus::{EventBus, Subscription};
use crate::lock::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
  Synced,
  /// Provisional changes not yet confirmed by the server
  Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Updated,
  Removed,
  RolledBack,
  StatusChanged,
}

/// Notification delivered to subscribers of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
  pub key: String,
  pub kind: ChangeKind,
  pub value: Option<Value>,
  pub status: SyncStatus,
}

/// Values of a set of keys at one point in time. Absent keys are recorded too,
/// so restoring removes anything created after the capture.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
  values: BTreeMap<String, Option<Value>>,
}

#[derive(Default)]
struct Inner {
  values: HashMap<String, Value>,
  pending: HashMap<String, usize>,
}

impl Inner {
  fn status(&self, key: &str) -> SyncStatus {
    match self.pending.get(key) {
      Some(count) if *count > 0 => SyncStatus::Pending,
      _ => SyncStatus::Synced,
    }
  }

  fn change(&self, key: &str, kind: ChangeKind) -> StateChange {
    StateChange {
      key: key.to_string(),
      kind,
      value: self.values.get(key).cloned(),
      status: self.status(key),
    }
  }
}

/// Shared state container. Clones share the same data and subscribers.
#[derive(Clone, Default)]
pub struct StateStore {
  inner: Arc<Mutex<Inner>>,
  changes: EventBus<String, StateChange>,
}

impl StateStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    lock(&self.inner).values.get(key).cloned()
  }

  pub fn set(&self, key: &str, value: Value) {
    let change = {
      let mut inner = lock(&self.inner);
      inner.values.insert(key.to_string(), value);
      inner.change(key, ChangeKind::Updated)
    };
    self.notify(change);
  }

  /// Replace the value of `key` with whatever `f` leaves in place.
  /// `None` going in means the key is absent; `None` coming out removes it.
  pub fn update<F>(&self, key: &str, f: F)
  where
    F: FnOnce(&mut Option<Value>),
  {
    let change = {
      let mut inner = lock(&self.inner);
      let mut slot = inner.values.remove(key);
      f(&mut slot);
      let kind = match slot {
        Some(value) => {
          inner.values.insert(key.to_string(), value);
          ChangeKind::Updated
        }
        None => ChangeKind::Removed,
      };
      inner.change(key, kind)
    };
    self.notify(change);
  }

  pub fn snapshot<S: AsRef<str>>(&self, keys: &[S]) -> Snapshot {
    let inner = lock(&self.inner);
    Snapshot {
      values: keys
        .iter()
        .map(|key| {
          let key = key.as_ref();
          (key.to_string(), inner.values.get(key).cloned())
        })
        .collect(),
    }
  }

  /// Put every key of `snapshot` back exactly as captured.
  pub fn restore(&self, snapshot: &Snapshot) {
    let changes: Vec<StateChange> = {
      let mut inner = lock(&self.inner);
      snapshot
        .values
        .iter()
        .map(|(key, value)| {
          match value {
            Some(value) => inner.values.insert(key.clone(), value.clone()),
            None => inner.values.remove(key),
          };
          inner.change(key, ChangeKind::RolledBack)
        })
        .collect()
    };
    for change in changes {
      self.notify(change);
    }
  }

  pub fn mark_pending<S: AsRef<str>>(&self, keys: &[S]) {
    self.adjust_pending(keys, |count| *count += 1);
  }

  pub fn mark_settled<S: AsRef<str>>(&self, keys: &[S]) {
    self.adjust_pending(keys, |count| *count = count.saturating_sub(1));
  }

  pub fn status(&self, key: &str) -> SyncStatus {
    lock(&self.inner).status(key)
  }

  /// Call `handler` after every change to `key`.
  pub fn subscribe<F>(&self, key: &str, handler: F) -> Subscription
  where
    F: Fn(&StateChange) + Send + Sync + 'static,
  {
    self.changes.subscribe(key.to_string(), handler)
  }

  fn adjust_pending<S, F>(&self, keys: &[S], adjust: F)
  where
    S: AsRef<str>,
    F: Fn(&mut usize),
  {
    let changes: Vec<StateChange> = {
      let mut inner = lock(&self.inner);
      keys
        .iter()
        .filter_map(|key| {
          let key = key.as_ref();
          let before = inner.status(key);
          let count = inner.pending.entry(key.to_string()).or_insert(0);
          adjust(count);
          if *count == 0 {
            inner.pending.remove(key);
          }
          (inner.status(key) != before).then(|| inner.change(key, ChangeKind::StatusChanged))
        })
        .collect()
    };
    for change in changes {
      self.notify(change);
    }
  }

  // Publish outside the lock so handlers may read the store.
  fn notify(&self, change: StateChange) {
    self.changes.publish(&change.key.clone(), &change);
  }
}
