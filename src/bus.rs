//! Typed publish/subscribe bus.
//!
//! Handlers run synchronously on the publishing task, in subscription order.
//! Dropping the [`Subscription`] removes the handler.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::lock::lock;

type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct Registry<K, P> {
  handlers: HashMap<K, Vec<(u64, Handler<P>)>>,
}

pub struct EventBus<K, P> {
  registry: Arc<Mutex<Registry<K, P>>>,
  next_id: Arc<AtomicU64>,
}

impl<K, P> EventBus<K, P>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  P: 'static,
{
  pub fn new() -> Self {
    Self {
      registry: Arc::new(Mutex::new(Registry {
        handlers: HashMap::new(),
      })),
      next_id: Arc::new(AtomicU64::new(1)),
    }
  }

  /// Register `handler` for `topic`. The handler stays registered for as long as
  /// the returned [`Subscription`] is alive.
  pub fn subscribe<F>(&self, topic: K, handler: F) -> Subscription
  where
    F: Fn(&P) + Send + Sync + 'static,
  {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    lock(&self.registry)
      .handlers
      .entry(topic.clone())
      .or_default()
      .push((id, Arc::new(handler)));

    let registry: Weak<Mutex<Registry<K, P>>> = Arc::downgrade(&self.registry);
    Subscription {
      cancel: Some(Box::new(move || {
        if let Some(registry) = registry.upgrade() {
          let mut registry = lock(&registry);
          if let Some(list) = registry.handlers.get_mut(&topic) {
            list.retain(|(handler_id, _)| *handler_id != id);
            if list.is_empty() {
              registry.handlers.remove(&topic);
            }
          }
        }
      })),
    }
  }

  /// Deliver `payload` to every handler subscribed to `topic`.
  ///
  /// Returns the number of handlers invoked.
  pub fn publish(&self, topic: &K, payload: &P) -> usize {
    // Snapshot so handlers may subscribe/unsubscribe without deadlocking.
    let handlers: Vec<Handler<P>> = lock(&self.registry)
      .handlers
      .get(topic)
      .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
      .unwrap_or_default();

    for handler in &handlers {
      handler(payload);
    }
    handlers.len()
  }

  #[cfg(test)]
  pub fn subscriber_count(&self, topic: &K) -> usize {
    lock(&self.registry)
      .handlers
      .get(topic)
      .map(Vec::len)
      .unwrap_or(0)
  }
}

impl<K, P> Default for EventBus<K, P>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  P: 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, P> Clone for EventBus<K, P> {
  fn clone(&self) -> Self {
    Self {
      registry: Arc::clone(&self.registry),
      next_id: Arc::clone(&self.next_id),
    }
  }
}

/// Handle returned by [`EventBus::subscribe`].
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
  cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      cancel();
    }
  }
}
