//! Network availability signal.
//!
//! The prober turns periodic health checks into online/offline transitions;
//! the sync worker listens for the transition to online and drains the queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Shared, cloneable view of the current connectivity state.
#[derive(Clone)]
pub struct ConnectivitySignal {
  tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivitySignal {
  pub fn new(initial: Connectivity) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn current(&self) -> Connectivity {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  /// Record the observed state. Returns true when this is a transition.
  pub fn set(&self, state: Connectivity) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });
    if changed {
      info!(state = ?state, "connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.tx.subscribe()
  }
}

/// Probe once and publish the result.
pub async fn probe_once<T: Transport>(transport: &T, signal: &ConnectivitySignal) -> Connectivity {
  let state = match transport.probe().await {
    Ok(()) => Connectivity::Online,
    Err(e) => {
      debug!(error = %e, "health probe failed");
      Connectivity::Offline
    }
  };
  signal.set(state);
  state
}

/// Probe forever at `interval`.
pub async fn run_prober<T: Transport>(
  transport: Arc<T>,
  signal: ConnectivitySignal,
  interval: Duration,
) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    probe_once(transport.as_ref(), &signal).await;
  }
}
