//! Time source used by the mutation queue.
//!
//! Scheduling decisions (eligibility, backoff, replay order) read time through
//! [`Clock`] so the state machine can be exercised without real timers.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall time anchored once at construction, advanced by the monotonic tokio clock.
///
/// Never goes backwards even if the system clock is adjusted while running, and
/// follows tokio's paused time in tests.
pub struct MonotonicClock {
  anchor_wall: DateTime<Utc>,
  anchor: Instant,
}

impl MonotonicClock {
  pub fn new() -> Self {
    Self {
      anchor_wall: Utc::now(),
      anchor: Instant::now(),
    }
  }
}

impl Default for MonotonicClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for MonotonicClock {
  fn now(&self) -> DateTime<Utc> {
    let elapsed = Instant::now().saturating_duration_since(self.anchor);
    let elapsed = chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
    self.anchor_wall + elapsed
  }
}
