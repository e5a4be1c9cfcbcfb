//! Retry delay schedule.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackoffError {
  #[error("backoff schedule must contain at least one delay")]
  Empty,
  #[error("backoff delay at position {0} is shorter than the one before it")]
  Decreasing(usize),
}

/// Capped, non-decreasing sequence of retry delays indexed by attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
  delays: Vec<Duration>,
}

impl BackoffSchedule {
  pub fn new(delays: Vec<Duration>) -> Result<Self, BackoffError> {
    if delays.is_empty() {
      return Err(BackoffError::Empty);
    }
    if let Some(pos) = delays.windows(2).position(|w| w[1] < w[0]) {
      return Err(BackoffError::Decreasing(pos + 1));
    }
    Ok(Self { delays })
  }

  /// Delay to wait after the `attempts`-th failed attempt (1-based).
  /// Clamps to the last delay once the sequence is exhausted.
  pub fn delay_for(&self, attempts: u32) -> Duration {
    let index = (attempts.max(1) as usize - 1).min(self.delays.len() - 1);
    self.delays[index]
  }

  pub fn cap(&self) -> Duration {
    self.delays[self.delays.len() - 1]
  }
}

impl Default for BackoffSchedule {
  fn default() -> Self {
    Self {
      delays: [1, 2, 5, 15, 30, 60]
        .into_iter()
        .map(Duration::from_secs)
        .collect(),
    }
  }
}
