//! Per-entry delivery state machine.
//!
//! Everything here is pure: no I/O, no timers, time passed in explicitly.
//!
//! ```text
//! Pending ──dispatch──> InFlight ──succeeded──> Delivered
//!                          │  └────rejected───> Rejected
//!                          └──failed──> RetryScheduled ──dispatch──> InFlight
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;

use crate::api::types::error_message;
use crate::api::{ApiResponse, TransportError};

use super::backoff::BackoffSchedule;
use super::entry::QueueEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
  Pending,
  InFlight,
  RetryScheduled,
  Delivered,
  Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Dispatch,
  Succeeded,
  FailedTransient,
  FailedTerminal,
}

impl EntryState {
  /// Apply `transition`, or `None` if it is not allowed from this state.
  pub fn on(self, transition: Transition) -> Option<EntryState> {
    use EntryState::*;
    use Transition::*;

    match (self, transition) {
      (Pending | RetryScheduled, Dispatch) => Some(InFlight),
      (InFlight, Succeeded) => Some(Delivered),
      (InFlight, FailedTransient) => Some(RetryScheduled),
      (InFlight, FailedTerminal) => Some(Rejected),
      _ => None,
    }
  }
}

/// How a delivery attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
  Delivered { payload: Value },
  Retry { error: String },
  Reject { status: u16, message: String },
}

impl Delivery {
  pub fn transition(&self) -> Transition {
    match self {
      Self::Delivered { .. } => Transition::Succeeded,
      Self::Retry { .. } => Transition::FailedTransient,
      Self::Reject { .. } => Transition::FailedTerminal,
    }
  }
}

/// Server statuses worth retrying: 5xx, request timeout and rate limiting.
pub fn is_transient(status: u16) -> bool {
  status >= 500 || status == 408 || status == 429
}

/// Status reported for a write refused before it reached the server.
pub const UNSENT_STATUS: u16 = 0;

pub fn classify(result: Result<ApiResponse, TransportError>) -> Delivery {
  match result {
    Err(e) if !e.is_retryable() => Delivery::Reject {
      status: UNSENT_STATUS,
      message: e.to_string(),
    },
    Err(e) => Delivery::Retry {
      error: e.to_string(),
    },
    Ok(response) if response.is_success() => Delivery::Delivered {
      payload: response.body,
    },
    Ok(response) if is_transient(response.status) => Delivery::Retry {
      error: format!(
        "server error {}: {}",
        response.status,
        error_message(response.status, &response.body)
      ),
    },
    Ok(response) => Delivery::Reject {
      status: response.status,
      message: error_message(response.status, &response.body),
    },
  }
}

/// Record a failed attempt on `entry` and push back its eligibility.
///
/// `next_eligible_at` never moves backwards, even if `now` does.
pub fn schedule_retry(
  entry: &mut QueueEntry,
  now: DateTime<Utc>,
  backoff: &BackoffSchedule,
  error: String,
) -> std::time::Duration {
  entry.attempts = entry.attempts.saturating_add(1);
  let delay = backoff.delay_for(entry.attempts);
  let candidate = chrono::Duration::from_std(delay)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC);
  entry.next_eligible_at = entry.next_eligible_at.max(candidate);
  entry.last_error = Some(error);
  delay
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection<'a> {
  /// Nothing queued
  Empty,
  /// Deliver this entry now
  Ready(&'a QueueEntry),
  /// Nothing is eligible; wake up at this instant
  Wait(DateTime<Utc>),
}

/// Pick the next entry to deliver.
///
/// Entries are walked in replay order. An eligible entry is skipped while an
/// earlier entry sharing one of its ordering keys is still backing off, so
/// mutations of one resource are always delivered in creation order.
pub fn select_next(entries: &[QueueEntry], now: DateTime<Utc>) -> Selection<'_> {
  if entries.is_empty() {
    return Selection::Empty;
  }

  let mut ordered: Vec<&QueueEntry> = entries.iter().collect();
  ordered.sort_by(|a, b| QueueEntry::replay_order(a, b));

  let mut blocked: HashSet<&str> = HashSet::new();
  for entry in ordered.iter().copied() {
    let keys = entry.ordering_keys();
    if entry.is_eligible(now) && !keys.iter().any(|k| blocked.contains(k)) {
      return Selection::Ready(entry);
    }
    blocked.extend(keys);
  }

  // The earliest entry in replay order is never blocked, so at least one
  // entry is still backing off here.
  Selection::Wait(earliest_wake(entries, now).unwrap_or(now))
}

/// Earliest future `next_eligible_at`. Entries already due but blocked behind
/// another are not counted; they become deliverable when their blocker does.
pub fn earliest_wake(entries: &[QueueEntry], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
  entries
    .iter()
    .map(|e| e.next_eligible_at)
    .filter(|at| *at > now)
    .min()
}
