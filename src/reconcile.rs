//! Optimistic updates over the mutation queue.
//!
//! A mutation is applied to local state immediately, queued for delivery, and
//! later either confirmed (affected resources are re-read from the server) or
//! rolled back to the snapshot taken just before it was applied.
//!
//! Resource keys are read paths: confirming a mutation re-reads each of them
//! through the cache.

use color_eyre::Result;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::{Operation, Transport};
use crate::bus::{EventBus, Subscription};
use crate::cache::{CacheLayer, CacheResult, ReadError};
use crate::lock::lock;
use crate::queue::{EnqueueReceipt, EntryId, MutationQueue, QueueEvent, QueueTopic};
use crate::state::{Snapshot, StateStore, SyncStatus};

/// A write and the resource keys whose local state it changes.
#[derive(Debug, Clone)]
pub struct Mutation {
  pub operation: Operation,
  pub resources: Vec<String>,
}

impl Mutation {
  pub fn new(operation: Operation, resources: Vec<String>) -> Self {
    Self {
      operation,
      resources,
    }
  }
}

/// Terminal result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  Delivered { payload: Value },
  Rejected { status: u16, message: String },
}

/// Returned once a mutation is accepted locally.
///
/// The receipt says whether it was stored durably and whether the device was
/// online; the outcome arrives later, whenever the queue reaches a verdict.
#[derive(Debug)]
pub struct MutationHandle {
  pub receipt: EnqueueReceipt,
  outcome: oneshot::Receiver<MutationOutcome>,
}

impl MutationHandle {
  pub fn id(&self) -> EntryId {
    self.receipt.id
  }

  /// Wait for delivery or rejection. `None` if the reconciler was dropped
  /// before either happened.
  pub async fn outcome(self) -> Option<MutationOutcome> {
    self.outcome.await.ok()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
  Rejected,
}

/// User-facing message about a mutation the server refused.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
  pub id: EntryId,
  pub status: u16,
  /// Server-provided reason, verbatim
  pub message: String,
  pub resources: Vec<String>,
}

struct Tracked {
  snapshot: Snapshot,
  resources: Vec<String>,
  outcome: oneshot::Sender<MutationOutcome>,
}

struct Inner<T: Transport> {
  queue: MutationQueue<T>,
  cache: CacheLayer<T>,
  state: StateStore,
  notices: EventBus<NoticeKind, Notice>,
  tracked: Mutex<HashMap<EntryId, Tracked>>,
  _subscriptions: Mutex<Vec<Subscription>>,
}

pub struct Reconciler<T: Transport> {
  inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Reconciler<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Transport> Reconciler<T> {
  pub fn new(queue: MutationQueue<T>, cache: CacheLayer<T>, state: StateStore) -> Self {
    let inner = Arc::new(Inner {
      queue,
      cache,
      state,
      notices: EventBus::new(),
      tracked: Mutex::new(HashMap::new()),
      _subscriptions: Mutex::new(Vec::new()),
    });

    let events = inner.queue.events();
    let subscriptions = vec![
      Self::on(&events, &inner, QueueTopic::Delivered),
      Self::on(&events, &inner, QueueTopic::RetryScheduled),
      Self::on(&events, &inner, QueueTopic::Rejected),
    ];
    *lock(&inner._subscriptions) = subscriptions;

    Self { inner }
  }

  // Handlers hold a weak reference so the subscriptions don't keep `Inner` alive.
  fn on(
    events: &EventBus<QueueTopic, QueueEvent>,
    inner: &Arc<Inner<T>>,
    topic: QueueTopic,
  ) -> Subscription {
    let weak: Weak<Inner<T>> = Arc::downgrade(inner);
    events.subscribe(topic, move |event: &QueueEvent| {
      if let Some(inner) = weak.upgrade() {
        Self::handle(&inner, event);
      }
    })
  }

  pub fn state(&self) -> &StateStore {
    &self.inner.state
  }

  pub fn queue(&self) -> &MutationQueue<T> {
    &self.inner.queue
  }

  pub fn notices(&self) -> EventBus<NoticeKind, Notice> {
    self.inner.notices.clone()
  }

  /// Read `path` through the cache into local state.
  ///
  /// Local state is left alone while the key has unsynced changes, so a read
  /// never clobbers a provisional value.
  pub async fn load(&self, path: &str) -> Result<CacheResult<Value>, ReadError> {
    let result = self.inner.cache.read(path).await?;
    debug!(%path, from_cache = result.from_cache(), "loaded");
    if self.inner.state.status(path) == SyncStatus::Synced {
      self.inner.state.set(path, result.data.clone());
    }
    Ok(result)
  }

  /// Apply `apply` to local state now and queue `mutation` for delivery.
  ///
  /// The snapshot restored on rejection is taken right before `apply` runs,
  /// so it includes the provisional effect of any earlier queued mutation.
  pub fn mutate<F>(&self, mutation: Mutation, apply: F) -> Result<MutationHandle>
  where
    F: FnOnce(&StateStore),
  {
    let Mutation {
      operation,
      resources,
    } = mutation;
    let state = &self.inner.state;

    let snapshot = state.snapshot(&resources);
    apply(state);
    state.mark_pending(&resources);

    // Registration happens under the lock so an outcome published before
    // `enqueue` returns waits for it.
    let mut tracked = lock(&self.inner.tracked);
    let receipt = match self.inner.queue.enqueue(operation, resources.clone()) {
      Ok(receipt) => receipt,
      Err(e) => {
        drop(tracked);
        state.restore(&snapshot);
        state.mark_settled(&resources);
        return Err(e);
      }
    };

    let (tx, rx) = oneshot::channel();
    tracked.insert(
      receipt.id,
      Tracked {
        snapshot,
        resources,
        outcome: tx,
      },
    );
    debug!(id = %receipt.id, durable = receipt.durable, "provisional change applied");

    Ok(MutationHandle {
      receipt,
      outcome: rx,
    })
  }

  fn handle(inner: &Arc<Inner<T>>, event: &QueueEvent) {
    match event {
      QueueEvent::Delivered {
        id,
        resources,
        payload,
      } => {
        let tracked = lock(&inner.tracked).remove(id);
        Self::confirm(inner, *id, resources.clone(), payload.clone(), tracked);
      }
      QueueEvent::Rejected {
        id,
        resources,
        status,
        message,
      } => {
        let tracked = lock(&inner.tracked).remove(id);
        if let Some(tracked) = &tracked {
          inner.state.restore(&tracked.snapshot);
          inner.state.mark_settled(&tracked.resources);
          info!(id = %id, "provisional change rolled back");
        }

        inner.notices.publish(
          &NoticeKind::Rejected,
          &Notice {
            id: *id,
            status: *status,
            message: message.clone(),
            resources: resources.clone(),
          },
        );

        if let Some(tracked) = tracked {
          Self::settle_rejection(inner, tracked, *status, message.clone());
        }
      }
      QueueEvent::RetryScheduled { id, attempts, .. } => {
        debug!(id = %id, attempts, "still pending sync");
      }
      QueueEvent::Enqueued { .. } => {}
    }
  }

  /// Refresh every affected resource from the server, then settle.
  ///
  /// Untracked deliveries come from entries queued by an earlier session; their
  /// resources are still refreshed.
  fn confirm(
    inner: &Arc<Inner<T>>,
    id: EntryId,
    resources: Vec<String>,
    payload: Value,
    tracked: Option<Tracked>,
  ) {
    let cache = inner.cache.clone();
    let state = inner.state.clone();

    tokio::spawn(async move {
      let outcome = tracked.map(|tracked| {
        state.mark_settled(&tracked.resources);
        tracked.outcome
      });
      Self::refresh(&cache, &state, &resources).await;
      debug!(id = %id, "delivery confirmed");

      if let Some(outcome) = outcome {
        let _ = outcome.send(MutationOutcome::Delivered { payload });
      }
    });
  }

  /// After a rollback, re-read keys with no other change in flight.
  ///
  /// The restored snapshot may hold an earlier provisional value that the
  /// server has since refused too; the server copy replaces it.
  fn settle_rejection(inner: &Arc<Inner<T>>, tracked: Tracked, status: u16, message: String) {
    let cache = inner.cache.clone();
    let state = inner.state.clone();
    let settled: Vec<String> = tracked
      .resources
      .into_iter()
      .filter(|key| state.status(key) == SyncStatus::Synced)
      .collect();
    let outcome = tracked.outcome;

    tokio::spawn(async move {
      Self::refresh(&cache, &state, &settled).await;
      let _ = outcome.send(MutationOutcome::Rejected { status, message });
    });
  }

  /// Re-read `keys` through the cache and store the results, skipping keys
  /// that picked up a new provisional change meanwhile.
  async fn refresh(cache: &CacheLayer<T>, state: &StateStore, keys: &[String]) {
    let results = join_all(keys.iter().map(|key| cache.read(key))).await;
    for (key, result) in keys.iter().zip(results) {
      match result {
        Ok(fresh) if state.status(key) == SyncStatus::Synced => state.set(key, fresh.data),
        Ok(_) => debug!(%key, "newer provisional change pending, keeping local value"),
        Err(e) => warn!(%key, error = %e, "refetch failed"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{ApiResponse, FetchResponse, Method, TransportError};
  use crate::cache::MemoryStorage;
  use crate::clock::MonotonicClock;
  use crate::connectivity::{Connectivity, ConnectivitySignal};
  use crate::queue::{BackoffSchedule, MemoryQueueStore};
  use crate::testing::RecordingTransport;
  use serde_json::json;

  const VILLAGE: &str = "/api/v1/villages/v1";

  struct Harness {
    reconciler: Reconciler<RecordingTransport>,
    transport: Arc<RecordingTransport>,
    signal: ConnectivitySignal,
  }

  fn harness(initial: Connectivity) -> Harness {
    let transport = Arc::new(RecordingTransport::new());
    let clock = Arc::new(MonotonicClock::new());
    let signal = ConnectivitySignal::new(initial);
    let (queue, _rx) = MutationQueue::new(
      Box::new(MemoryQueueStore::new()),
      Arc::clone(&transport),
      clock.clone(),
      BackoffSchedule::default(),
      signal.clone(),
    );
    let cache = CacheLayer::new(
      Arc::new(MemoryStorage::default()),
      Arc::clone(&transport),
      signal.clone(),
      clock,
    );
    Harness {
      reconciler: Reconciler::new(queue, cache, StateStore::new()),
      transport,
      signal,
    }
  }

  fn rename(name: &str) -> Mutation {
    Mutation::new(
      Operation::new(Method::Patch, VILLAGE).with_json(&json!({"name": name})),
      vec![VILLAGE.into()],
    )
  }

  fn apply_name(name: &'static str) -> impl FnOnce(&StateStore) {
    move |state| {
      state.update(VILLAGE, |slot| {
        if let Some(Value::Object(fields)) = slot {
          fields.insert("name".into(), json!(name));
        }
      })
    }
  }

  fn conflict() -> Result<ApiResponse, TransportError> {
    Ok(ApiResponse::new(
      409,
      json!({"error": {"message": "Conflict", "code": "conflict"}}),
    ))
  }

  #[tokio::test]
  async fn test_rejection_rolls_back_exactly_once() {
    let h = harness(Connectivity::Offline);
    let state = h.reconciler.state().clone();
    state.set(VILLAGE, json!({"id": "v1", "name": "Harbor"}));

    let rollbacks = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&rollbacks);
    let _sub = state.subscribe(VILLAGE, move |change| {
      if change.kind == crate::state::ChangeKind::RolledBack {
        *lock(&counter) += 1;
      }
    });
    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notices);
    let _notice_sub = h
      .reconciler
      .notices()
      .subscribe(NoticeKind::Rejected, move |n: &Notice| lock(&sink).push(n.clone()));

    let handle = h
      .reconciler
      .mutate(rename("Renamed"), apply_name("Renamed"))
      .unwrap();
    assert!(!handle.receipt.online);
    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "Renamed"})));
    assert_eq!(state.status(VILLAGE), SyncStatus::Pending);

    h.transport.push_send(conflict());
    h.signal.set(Connectivity::Online);
    h.reconciler.queue().drain().await;

    assert_eq!(
      handle.outcome().await,
      Some(MutationOutcome::Rejected {
        status: 409,
        message: "Conflict".into()
      })
    );
    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "Harbor"})));
    assert_eq!(state.status(VILLAGE), SyncStatus::Synced);
    assert_eq!(*lock(&rollbacks), 1);
    assert_eq!(lock(&notices).len(), 1);
    assert_eq!(lock(&notices)[0].message, "Conflict");

    // Entry is gone; nothing further is sent.
    h.reconciler.queue().drain().await;
    assert_eq!(h.transport.sent().len(), 1);
    assert!(h.reconciler.queue().pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_delivery_refetches_every_resource() {
    let h = harness(Connectivity::Online);
    let list = "/api/v1/villages/";
    h.transport.push_fetch(
      VILLAGE,
      Ok(FetchResponse::Fresh {
        token: Some("a".into()),
        payload: json!({"id": "v1", "name": "Server"}),
      }),
    );
    h.transport.push_fetch(
      list,
      Ok(FetchResponse::Fresh {
        token: Some("b".into()),
        payload: json!([{"id": "v1", "name": "Server"}]),
      }),
    );

    let mutation = Mutation::new(
      Operation::new(Method::Patch, VILLAGE).with_json(&json!({"name": "Server"})),
      vec![VILLAGE.into(), list.into()],
    );
    let handle = h.reconciler.mutate(mutation, |_| {}).unwrap();
    h.reconciler.queue().drain().await;

    assert!(matches!(
      handle.outcome().await,
      Some(MutationOutcome::Delivered { .. })
    ));
    let mut fetched: Vec<String> = h.transport.fetched().into_iter().map(|f| f.path).collect();
    fetched.sort();
    assert_eq!(fetched, vec![list.to_string(), VILLAGE.to_string()]);

    let state = h.reconciler.state();
    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "Server"})));
    assert_eq!(state.get(list), Some(json!([{"id": "v1", "name": "Server"}])));
    assert_eq!(state.status(VILLAGE), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_second_update_rejected_keeps_first() {
    let h = harness(Connectivity::Offline);
    let state = h.reconciler.state().clone();
    state.set(VILLAGE, json!({"id": "v1", "name": "Harbor"}));

    let first = h
      .reconciler
      .mutate(rename("First"), apply_name("First"))
      .unwrap();
    let second = h
      .reconciler
      .mutate(rename("Second"), apply_name("Second"))
      .unwrap();
    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "Second"})));

    h.transport
      .push_send(Ok(ApiResponse::new(200, json!({"id": "v1", "name": "First"}))));
    h.transport.push_send(conflict());
    h.transport.push_fetch(
      VILLAGE,
      Ok(FetchResponse::Fresh {
        token: Some("x".into()),
        payload: json!({"id": "v1", "name": "First"}),
      }),
    );

    h.signal.set(Connectivity::Online);
    let report = h.reconciler.queue().drain().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.rejected, 1);

    assert!(matches!(
      first.outcome().await,
      Some(MutationOutcome::Delivered { .. })
    ));
    assert!(matches!(
      second.outcome().await,
      Some(MutationOutcome::Rejected { .. })
    ));
    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "First"})));
    assert_eq!(state.status(VILLAGE), SyncStatus::Synced);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].operation.body.as_deref(), Some(r#"{"name":"First"}"#));
  }

  #[tokio::test]
  async fn test_both_updates_rejected_converges_on_server_value() {
    let h = harness(Connectivity::Offline);
    let state = h.reconciler.state().clone();
    state.set(VILLAGE, json!({"id": "v1", "name": "Harbor"}));

    let first = h
      .reconciler
      .mutate(rename("First"), apply_name("First"))
      .unwrap();
    let second = h
      .reconciler
      .mutate(rename("Second"), apply_name("Second"))
      .unwrap();

    h.transport.push_send(conflict());
    h.transport.push_send(conflict());
    h.transport.push_fetch(
      VILLAGE,
      Ok(FetchResponse::Fresh {
        token: Some("h".into()),
        payload: json!({"id": "v1", "name": "Harbor"}),
      }),
    );

    h.signal.set(Connectivity::Online);
    assert_eq!(h.reconciler.queue().drain().await.rejected, 2);

    assert!(matches!(
      first.outcome().await,
      Some(MutationOutcome::Rejected { .. })
    ));
    assert!(matches!(
      second.outcome().await,
      Some(MutationOutcome::Rejected { .. })
    ));
    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "Harbor"})));
    assert_eq!(state.status(VILLAGE), SyncStatus::Synced);
    // Only the last rollback leaves the key settled, so it alone re-reads.
    assert_eq!(h.transport.fetched().len(), 1);
  }

  #[tokio::test]
  async fn test_retry_keeps_provisional_state() {
    let h = harness(Connectivity::Online);
    let state = h.reconciler.state().clone();
    state.set(VILLAGE, json!({"id": "v1", "name": "Harbor"}));
    h.transport.push_send(Ok(ApiResponse::new(500, json!({"detail": "boom"}))));

    let _handle = h
      .reconciler
      .mutate(rename("Renamed"), apply_name("Renamed"))
      .unwrap();
    h.reconciler.queue().drain().await;

    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "Renamed"})));
    assert_eq!(state.status(VILLAGE), SyncStatus::Pending);
    assert_eq!(h.reconciler.queue().pending().unwrap()[0].entry.attempts, 1);
  }

  #[tokio::test]
  async fn test_load_does_not_clobber_pending_value() {
    let h = harness(Connectivity::Online);
    let state = h.reconciler.state().clone();
    h.transport.push_send(Err(TransportError::Timeout));
    h.transport.push_fetch(
      VILLAGE,
      Ok(FetchResponse::Fresh {
        token: None,
        payload: json!({"id": "v1", "name": "Harbor"}),
      }),
    );

    let _handle = h
      .reconciler
      .mutate(rename("Renamed"), |s| {
        s.set(VILLAGE, json!({"id": "v1", "name": "Renamed"}))
      })
      .unwrap();
    h.reconciler.queue().drain().await;

    let read = h.reconciler.load(VILLAGE).await.unwrap();
    assert_eq!(read.data, json!({"id": "v1", "name": "Harbor"}));
    assert_eq!(state.get(VILLAGE), Some(json!({"id": "v1", "name": "Renamed"})));
  }
}
