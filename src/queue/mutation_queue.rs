//! Durable outbox of pending mutations with ordered, at-least-once replay.

use chrono::{DateTime, SubsecRound, Utc};
use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{Operation, Transport};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::connectivity::ConnectivitySignal;
use crate::lock::lock;

use super::backoff::BackoffSchedule;
use super::entry::{EntryId, QueueEntry};
use super::events::{DrainReport, DrainTrigger, EnqueueReceipt, QueueEvent, QueueTopic};
use super::machine::{self, Delivery, EntryState, Selection, Transition};
use super::store::QueueStore;

/// Backoff timer owned by the queue. At most one exists at a time.
struct ArmedTimer {
  wake_at: DateTime<Utc>,
  handle: JoinHandle<()>,
}

struct Inner<T: Transport> {
  store: Box<dyn QueueStore>,
  transport: Arc<T>,
  clock: Arc<dyn Clock>,
  backoff: BackoffSchedule,
  connectivity: ConnectivitySignal,
  events: EventBus<QueueTopic, QueueEvent>,
  triggers: mpsc::UnboundedSender<DrainTrigger>,
  /// Re-entrancy guard for `drain`
  draining: AtomicBool,
  in_flight: Mutex<Option<EntryId>>,
  last_created: Mutex<Option<DateTime<Utc>>>,
  timer: Mutex<Option<ArmedTimer>>,
}

/// Cheaply cloneable handle to the mutation queue.
pub struct MutationQueue<T: Transport> {
  inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for MutationQueue<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Entry as shown to the user, with its current delivery state.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
  pub entry: QueueEntry,
  pub state: EntryState,
}

/// Resets the re-entrancy flag when a drain pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl<T: Transport> MutationQueue<T> {
  /// Create a queue over `store`.
  ///
  /// The returned receiver yields drain requests (new entries, elapsed backoff
  /// timers) and is meant to be handed to the sync worker.
  pub fn new(
    store: Box<dyn QueueStore>,
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    backoff: BackoffSchedule,
    connectivity: ConnectivitySignal,
  ) -> (Self, mpsc::UnboundedReceiver<DrainTrigger>) {
    let (triggers, trigger_rx) = mpsc::unbounded_channel();
    let last_created = store
      .get_all()
      .ok()
      .and_then(|entries| entries.iter().map(|e| e.created_at).max());

    let queue = Self {
      inner: Arc::new(Inner {
        store,
        transport,
        clock,
        backoff,
        connectivity,
        events: EventBus::new(),
        triggers,
        draining: AtomicBool::new(false),
        in_flight: Mutex::new(None),
        last_created: Mutex::new(last_created),
        timer: Mutex::new(None),
      }),
    };
    (queue, trigger_rx)
  }

  /// Bus on which delivery outcomes are published.
  pub fn events(&self) -> EventBus<QueueTopic, QueueEvent> {
    self.inner.events.clone()
  }

  /// Persist a mutation and request a drain.
  ///
  /// Succeeds whenever the entry could be stored locally; network state never
  /// makes this fail.
  pub fn enqueue(&self, operation: Operation, resources: Vec<String>) -> Result<EnqueueReceipt> {
    operation.validate()?;
    let now = self.inner.clock.now();
    let created_at = self.next_created_at(now);
    let mut entry = QueueEntry::new(operation, resources, created_at);
    // The ordering bump may push created_at past now; eligibility must not wait on it.
    entry.next_eligible_at = created_at.min(now);
    self.inner.store.put(&entry)?;

    info!(
      id = %entry.id,
      method = %entry.operation.method,
      path = %entry.operation.path,
      "mutation queued"
    );

    self.publish(QueueEvent::Enqueued {
      id: entry.id,
      resources: entry.resources.clone(),
    });
    // Nobody listening just means no worker is running; the next drain picks it up.
    let _ = self.inner.triggers.send(DrainTrigger::Enqueued);

    Ok(EnqueueReceipt {
      id: entry.id,
      created_at,
      durable: self.inner.store.is_durable(),
      online: self.inner.connectivity.is_online(),
    })
  }

  /// Strictly increasing creation time at storage precision.
  fn next_created_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    let mut last = lock(&self.inner.last_created);
    let created_at = match *last {
      Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
      _ => now,
    };
    *last = Some(created_at);
    created_at
  }

  /// Deliver eligible entries one at a time, in order, until none remain
  /// eligible or an attempt fails transiently.
  ///
  /// A call made while another pass is running returns immediately with
  /// `skipped` set.
  pub async fn drain(&self) -> DrainReport {
    if self
      .inner
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("drain already in progress");
      return DrainReport {
        skipped: true,
        ..Default::default()
      };
    }
    let _guard = DrainGuard(&self.inner.draining);

    let mut report = DrainReport::default();
    loop {
      if !self.inner.connectivity.is_online() {
        debug!("offline, not draining");
        break;
      }

      let entries = match self.inner.store.get_all() {
        Ok(entries) => entries,
        Err(e) => {
          warn!(error = %e, "failed to load queue");
          break;
        }
      };

      let now = self.inner.clock.now();
      let entry = match machine::select_next(&entries, now) {
        Selection::Empty => break,
        Selection::Wait(wake_at) => {
          self.arm_timer(wake_at);
          break;
        }
        Selection::Ready(entry) => entry.clone(),
      };

      match self.attempt(entry).await {
        EntryState::Delivered => report.delivered += 1,
        EntryState::Rejected => report.rejected += 1,
        _ => {
          report.retried += 1;
          // Stop here: later entries wait for the next trigger.
          self.schedule_wake();
          break;
        }
      }
    }

    if report.attempts() > 0 {
      debug!(
        delivered = report.delivered,
        rejected = report.rejected,
        retried = report.retried,
        "drain pass finished"
      );
    }
    report
  }

  /// One delivery attempt. Returns the state the entry ended in.
  async fn attempt(&self, mut entry: QueueEntry) -> EntryState {
    let Some(state) = entry.state().on(Transition::Dispatch) else {
      return entry.state();
    };
    *lock(&self.inner.in_flight) = Some(entry.id);
    debug!(
      id = %entry.id,
      path = %entry.operation.path,
      attempt = entry.attempts + 1,
      "delivering mutation"
    );

    let result = self.inner.transport.send(&entry.operation).await;
    *lock(&self.inner.in_flight) = None;

    let delivery = machine::classify(result);
    let next = state.on(delivery.transition()).unwrap_or(state);

    match delivery {
      Delivery::Delivered { payload } => {
        self.remove(&entry.id);
        info!(id = %entry.id, path = %entry.operation.path, "mutation delivered");
        self.publish(QueueEvent::Delivered {
          id: entry.id,
          resources: entry.resources,
          payload,
        });
      }
      Delivery::Reject { status, message } => {
        self.remove(&entry.id);
        warn!(id = %entry.id, status, message = %message, "mutation rejected");
        self.publish(QueueEvent::Rejected {
          id: entry.id,
          resources: entry.resources,
          status,
          message,
        });
      }
      Delivery::Retry { error } => {
        let now = self.inner.clock.now();
        let delay = machine::schedule_retry(&mut entry, now, &self.inner.backoff, error.clone());
        if let Err(e) = self.inner.store.update(&entry) {
          warn!(id = %entry.id, error = %e, "failed to persist retry state");
        }
        info!(
          id = %entry.id,
          attempts = entry.attempts,
          delay_ms = delay.as_millis() as u64,
          error = %error,
          "mutation delivery failed, retry scheduled"
        );
        self.publish(QueueEvent::RetryScheduled {
          id: entry.id,
          resources: entry.resources,
          attempts: entry.attempts,
          next_eligible_at: entry.next_eligible_at,
          error,
        });
      }
    }
    next
  }

  fn publish(&self, event: QueueEvent) {
    self.inner.events.publish(&event.topic(), &event);
  }

  fn remove(&self, id: &EntryId) {
    if let Err(e) = self.inner.store.delete(id) {
      // The entry may be delivered again after a restart; delivery is at-least-once.
      warn!(id = %id, error = %e, "failed to remove finished entry");
    }
  }

  /// Arm the timer for the earliest future `next_eligible_at`, if any.
  fn schedule_wake(&self) {
    let now = self.inner.clock.now();
    let wake_at = self
      .inner
      .store
      .get_all()
      .ok()
      .and_then(|entries| machine::earliest_wake(&entries, now));
    if let Some(wake_at) = wake_at {
      self.arm_timer(wake_at);
    }
  }

  fn arm_timer(&self, wake_at: DateTime<Utc>) {
    let mut timer = lock(&self.inner.timer);
    if let Some(existing) = timer.as_ref() {
      if existing.wake_at == wake_at && !existing.handle.is_finished() {
        return;
      }
    }
    if let Some(existing) = timer.take() {
      existing.handle.abort();
    }

    let delay = (wake_at - self.inner.clock.now())
      .to_std()
      .unwrap_or(std::time::Duration::ZERO);
    let triggers = self.inner.triggers.clone();
    let handle = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = triggers.send(DrainTrigger::Timer);
    });

    debug!(wake_at = %wake_at, delay_ms = delay.as_millis() as u64, "backoff timer armed");
    *timer = Some(ArmedTimer { wake_at, handle });
  }

  /// When the backoff timer will next fire, if one is armed.
  pub fn next_wake(&self) -> Option<DateTime<Utc>> {
    lock(&self.inner.timer)
      .as_ref()
      .filter(|t| !t.handle.is_finished())
      .map(|t| t.wake_at)
  }

  /// Pending entries in replay order.
  pub fn pending(&self) -> Result<Vec<PendingEntry>> {
    let in_flight = *lock(&self.inner.in_flight);
    let mut entries = self.inner.store.get_all()?;
    entries.sort_by(QueueEntry::replay_order);

    Ok(
      entries
        .into_iter()
        .map(|entry| {
          let state = if Some(entry.id) == in_flight {
            EntryState::InFlight
          } else {
            entry.state()
          };
          PendingEntry { entry, state }
        })
        .collect(),
    )
  }

  pub fn is_durable(&self) -> bool {
    self.inner.store.is_durable()
  }
}

impl<T: Transport> Drop for Inner<T> {
  fn drop(&mut self) {
    if let Some(timer) = lock(&self.timer).take() {
      timer.handle.abort();
    }
  }
}
