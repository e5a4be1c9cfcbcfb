//! Background task that owns drain scheduling.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::api::Transport;
use crate::connectivity::{Connectivity, ConnectivitySignal};

use super::events::DrainTrigger;
use super::mutation_queue::MutationQueue;

/// Drain on startup, on every trigger from the queue and whenever
/// connectivity comes back.
///
/// The `queue` handle owns the trigger sender, so the channel stays open for
/// as long as this runs; stop the worker by aborting its task.
pub async fn run<T: Transport>(
  queue: MutationQueue<T>,
  mut triggers: mpsc::UnboundedReceiver<DrainTrigger>,
  signal: ConnectivitySignal,
) {
  let mut connectivity = signal.subscribe();

  queue.drain().await;

  loop {
    tokio::select! {
      trigger = triggers.recv() => {
        let Some(trigger) = trigger else { break };
        // Collapse a burst of triggers into one pass.
        while triggers.try_recv().is_ok() {}
        debug!(?trigger, "drain requested");
        queue.drain().await;
      }
      changed = connectivity.changed() => {
        if changed.is_err() {
          break;
        }
        let state = *connectivity.borrow_and_update();
        match state {
          Connectivity::Online => {
            info!("back online, replaying queued mutations");
            queue.drain().await;
          }
          Connectivity::Offline => {
            info!("offline, queued mutations will wait");
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{Method, Operation};
  use crate::clock::MonotonicClock;
  use crate::queue::{BackoffSchedule, MemoryQueueStore};
  use crate::testing::RecordingTransport;
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_triggers_exactly_one_delivery() {
    let transport = Arc::new(RecordingTransport::new());
    let signal = ConnectivitySignal::new(Connectivity::Offline);
    let (queue, rx) = MutationQueue::new(
      Box::new(MemoryQueueStore::new()),
      Arc::clone(&transport),
      Arc::new(MonotonicClock::new()),
      BackoffSchedule::default(),
      signal.clone(),
    );
    let worker = tokio::spawn(run(queue.clone(), rx, signal.clone()));

    queue
      .enqueue(Operation::new(Method::Post, "/api/v1/villages/"), vec![])
      .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(transport.sent().is_empty());
    assert_eq!(queue.pending().unwrap().len(), 1);

    signal.set(Connectivity::Online);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent().len(), 1);
    assert!(queue.pending().unwrap().is_empty());

    // Flapping offline/online with an empty queue sends nothing more.
    signal.set(Connectivity::Offline);
    signal.set(Connectivity::Online);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.sent().len(), 1);

    worker.abort();
  }
}
