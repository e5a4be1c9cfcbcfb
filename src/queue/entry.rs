//! Queue entry model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::api::Operation;

use super::machine::EntryState;

/// Stable identifier assigned at enqueue time. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for EntryId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for EntryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl FromStr for EntryId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s).map(Self)
  }
}

/// A single pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
  pub id: EntryId,
  pub operation: Operation,
  /// Logical resource keys this mutation affects
  pub resources: Vec<String>,
  /// Delivery attempts made so far
  pub attempts: u32,
  /// The entry must not be retried before this instant
  pub next_eligible_at: DateTime<Utc>,
  /// Defines replay order
  pub created_at: DateTime<Utc>,
  /// Most recent failure, for diagnostics only
  pub last_error: Option<String>,
}

impl QueueEntry {
  pub fn new(operation: Operation, resources: Vec<String>, created_at: DateTime<Utc>) -> Self {
    Self {
      id: EntryId::new(),
      operation,
      resources,
      attempts: 0,
      next_eligible_at: created_at,
      created_at,
      last_error: None,
    }
  }

  /// Persisted state. In-flight is only ever known to the running queue.
  pub fn state(&self) -> EntryState {
    if self.attempts == 0 {
      EntryState::Pending
    } else {
      EntryState::RetryScheduled
    }
  }

  pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
    self.next_eligible_at <= now
  }

  /// Keys used to keep mutations against the same resource in creation order.
  /// Entries without declared resources are ordered by their target path.
  pub fn ordering_keys(&self) -> Vec<&str> {
    if self.resources.is_empty() {
      vec![self.operation.path.as_str()]
    } else {
      self.resources.iter().map(String::as_str).collect()
    }
  }

  pub fn replay_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    a.created_at
      .cmp(&b.created_at)
      .then_with(|| a.id.cmp(&b.id))
  }
}
