use chrono::{DateTime, Utc};
use serde_json::Value;

use super::entry::EntryId;

/// Topics published on the queue's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueTopic {
  Enqueued,
  Delivered,
  RetryScheduled,
  Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
  Enqueued {
    id: EntryId,
    resources: Vec<String>,
  },
  /// Terminal: the server accepted the mutation. Published once, after the
  /// entry has been removed from storage.
  Delivered {
    id: EntryId,
    resources: Vec<String>,
    payload: Value,
  },
  /// The attempt failed transiently; the entry stays queued.
  RetryScheduled {
    id: EntryId,
    resources: Vec<String>,
    attempts: u32,
    next_eligible_at: DateTime<Utc>,
    error: String,
  },
  /// Terminal: the server refused the mutation. Published once, after the
  /// entry has been removed from storage.
  Rejected {
    id: EntryId,
    resources: Vec<String>,
    status: u16,
    message: String,
  },
}

impl QueueEvent {
  pub fn topic(&self) -> QueueTopic {
    match self {
      Self::Enqueued { .. } => QueueTopic::Enqueued,
      Self::Delivered { .. } => QueueTopic::Delivered,
      Self::RetryScheduled { .. } => QueueTopic::RetryScheduled,
      Self::Rejected { .. } => QueueTopic::Rejected,
    }
  }

  pub fn id(&self) -> EntryId {
    match self {
      Self::Enqueued { id, .. }
      | Self::Delivered { id, .. }
      | Self::RetryScheduled { id, .. }
      | Self::Rejected { id, .. } => *id,
    }
  }
}

/// Why the sync worker was asked to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
  Enqueued,
  Timer,
}

/// Local acceptance of a mutation. Says nothing about delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueReceipt {
  pub id: EntryId,
  pub created_at: DateTime<Utc>,
  /// Whether the entry reached durable storage
  pub durable: bool,
  /// Whether a delivery attempt can start right away
  pub online: bool,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  pub rejected: usize,
  pub retried: usize,
  /// Another pass was already running; this call did nothing
  pub skipped: bool,
}

impl DrainReport {
  pub fn attempts(&self) -> usize {
    self.delivered + self.rejected + self.retried
  }
}
