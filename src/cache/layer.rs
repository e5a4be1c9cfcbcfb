//! Cache layer that orchestrates conditional reads with offline fallback.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{error_message, FetchResponse, Transport, TransportError};
use crate::clock::Clock;
use crate::connectivity::ConnectivitySignal;
use crate::queue::is_transient;

use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult, ReadError, RequestKey};

/// Cache layer that manages revalidation and network fetching.
///
/// This layer sits between the application and the transport. Reads only:
/// writes go through the mutation queue and refresh affected keys afterwards
/// by reading them again.
pub struct CacheLayer<T: Transport> {
  storage: Arc<dyn CacheStorage>,
  transport: Arc<T>,
  connectivity: ConnectivitySignal,
  clock: Arc<dyn Clock>,
}

impl<T: Transport> CacheLayer<T> {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    transport: Arc<T>,
    connectivity: ConnectivitySignal,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      storage,
      transport,
      connectivity,
      clock,
    }
  }

  /// Read `path` with revalidation.
  ///
  /// 1. Offline: serve the cached copy, or fail with [`ReadError::Offline`]
  /// 2. Online: GET with the stored token as `If-None-Match`
  /// 3. 304 returns the cached payload untouched
  /// 4. A fresh body replaces the entry
  /// 5. Transport faults and transient server errors fall back to the cache
  pub async fn read(&self, path: &str) -> Result<CacheResult<Value>, ReadError> {
    let key = RequestKey::get(self.transport.resolve(path));
    let cached = self.lookup(&key);

    if !self.connectivity.is_online() {
      return match cached {
        Some(entry) => {
          debug!(%path, "offline, serving cached copy");
          Ok(CacheResult::offline(entry.payload, entry.cached_at))
        }
        None => Err(ReadError::Offline),
      };
    }

    let token = cached.as_ref().and_then(|entry| entry.token.as_deref());
    match self.transport.fetch(path, token).await {
      Ok(FetchResponse::NotModified) => match cached {
        Some(entry) => {
          debug!(%path, "not modified");
          Ok(CacheResult::revalidated(entry.payload, entry.cached_at))
        }
        None => Err(ReadError::Transport(TransportError::Protocol(format!(
          "304 for {} without a cached copy",
          path
        )))),
      },
      Ok(FetchResponse::Fresh { token, payload }) => {
        debug!(%path, token = ?token, "fresh body");
        self.store(CacheEntry {
          key,
          token,
          payload: payload.clone(),
          cached_at: self.clock.now(),
        });
        Ok(CacheResult::from_network(payload))
      }
      Ok(FetchResponse::Failed { status, body }) if is_transient(status) => {
        let message = error_message(status, &body);
        Self::fallback(path, cached, ReadError::Rejected { status, message })
      }
      Ok(FetchResponse::Failed { status, body }) => Err(ReadError::Rejected {
        status,
        message: error_message(status, &body),
      }),
      Err(e) => Self::fallback(path, cached, ReadError::Transport(e)),
    }
  }

  /// Drop every cached entry.
  pub fn clear(&self) -> color_eyre::Result<()> {
    self.storage.clear()?;
    info!("cache cleared");
    Ok(())
  }

  fn fallback(
    path: &str,
    cached: Option<CacheEntry>,
    error: ReadError,
  ) -> Result<CacheResult<Value>, ReadError> {
    match cached {
      Some(entry) => {
        info!(%path, error = %error, "network read failed, serving cached copy");
        Ok(CacheResult::offline(entry.payload, entry.cached_at))
      }
      None => Err(error),
    }
  }

  /// Storage faults degrade to a miss; reads never fail because of the cache.
  fn lookup(&self, key: &RequestKey) -> Option<CacheEntry> {
    match self.storage.get(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(error = %e, url = %key.url, "cache lookup failed");
        None
      }
    }
  }

  fn store(&self, entry: CacheEntry) {
    if let Err(e) = self.storage.put(&entry) {
      warn!(error = %e, url = %entry.key.url, "cache write failed");
    }
  }
}

impl<T: Transport> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      transport: Arc::clone(&self.transport),
      connectivity: self.connectivity.clone(),
      clock: Arc::clone(&self.clock),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheSource;
  use crate::cache::MemoryStorage;
  use crate::clock::MonotonicClock;
  use crate::connectivity::Connectivity;
  use crate::testing::{FetchRequest, RecordingTransport};
  use serde_json::json;

  const VILLAGES: &str = "/api/v1/villages/";

  fn layer(state: Connectivity) -> (CacheLayer<RecordingTransport>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let cache = CacheLayer::new(
      Arc::new(MemoryStorage::default()),
      Arc::clone(&transport),
      ConnectivitySignal::new(state),
      Arc::new(MonotonicClock::new()),
    );
    (cache, transport)
  }

  fn fresh(token: &str, payload: Value) -> Result<FetchResponse, TransportError> {
    Ok(FetchResponse::Fresh {
      token: Some(token.to_string()),
      payload,
    })
  }

  #[tokio::test]
  async fn test_fresh_then_not_modified_attaches_token() {
    let (cache, transport) = layer(Connectivity::Online);
    let payload = json!([{"id": "v1", "name": "Harbor"}]);
    transport.push_fetch(VILLAGES, fresh("\"abc\"", payload.clone()));
    transport.push_fetch(VILLAGES, Ok(FetchResponse::NotModified));

    let first = cache.read(VILLAGES).await.unwrap();
    assert_eq!(first.data, payload);
    assert!(!first.from_cache());

    let second = cache.read(VILLAGES).await.unwrap();
    assert_eq!(second.data, payload);
    assert_eq!(second.source, CacheSource::Revalidated);
    assert!(second.from_cache());

    assert_eq!(
      transport.fetched(),
      vec![
        FetchRequest {
          path: VILLAGES.into(),
          token: None
        },
        FetchRequest {
          path: VILLAGES.into(),
          token: Some("\"abc\"".into())
        },
      ]
    );
  }

  #[tokio::test]
  async fn test_fresh_body_replaces_payload_and_token() {
    let (cache, transport) = layer(Connectivity::Online);
    transport.push_fetch(VILLAGES, fresh("a", json!([])));
    transport.push_fetch(VILLAGES, fresh("b", json!([{"id": "v2"}])));
    transport.push_fetch(VILLAGES, Ok(FetchResponse::NotModified));

    cache.read(VILLAGES).await.unwrap();
    cache.read(VILLAGES).await.unwrap();
    let third = cache.read(VILLAGES).await.unwrap();

    assert_eq!(third.data, json!([{"id": "v2"}]));
    assert_eq!(transport.fetched()[2].token.as_deref(), Some("b"));
  }

  #[tokio::test]
  async fn test_transport_failure_falls_back_to_cache() {
    let (cache, transport) = layer(Connectivity::Online);
    transport.push_fetch(VILLAGES, fresh("a", json!([{"id": "v1"}])));
    transport.push_fetch(VILLAGES, Err(TransportError::Timeout));
    transport.push_fetch(
      VILLAGES,
      Ok(FetchResponse::Failed {
        status: 503,
        body: json!({"detail": "down"}),
      }),
    );

    cache.read(VILLAGES).await.unwrap();
    let timed_out = cache.read(VILLAGES).await.unwrap();
    assert_eq!(timed_out.source, CacheSource::Offline);
    assert_eq!(timed_out.data, json!([{"id": "v1"}]));

    let unavailable = cache.read(VILLAGES).await.unwrap();
    assert_eq!(unavailable.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_failure_without_cache_propagates() {
    let (cache, transport) = layer(Connectivity::Online);
    transport.push_fetch(VILLAGES, Err(TransportError::Timeout));

    assert_eq!(
      cache.read(VILLAGES).await,
      Err(ReadError::Transport(TransportError::Timeout))
    );
  }

  #[tokio::test]
  async fn test_client_error_is_not_masked_by_cache() {
    let (cache, transport) = layer(Connectivity::Online);
    let path = "/api/v1/villages/missing";
    transport.push_fetch(path, fresh("a", json!({"id": "missing"})));
    transport.push_fetch(
      path,
      Ok(FetchResponse::Failed {
        status: 404,
        body: json!({"detail": "Village not found"}),
      }),
    );

    cache.read(path).await.unwrap();
    assert_eq!(
      cache.read(path).await,
      Err(ReadError::Rejected {
        status: 404,
        message: "Village not found".into()
      })
    );
  }

  #[tokio::test]
  async fn test_offline_serves_cache_without_network() {
    let (cache, transport) = layer(Connectivity::Online);
    transport.push_fetch(VILLAGES, fresh("a", json!([1, 2])));
    cache.read(VILLAGES).await.unwrap();

    cache.connectivity.set(Connectivity::Offline);
    let result = cache.read(VILLAGES).await.unwrap();
    assert_eq!(result.data, json!([1, 2]));
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(cache.read("/api/v1/plants/").await, Err(ReadError::Offline));
    assert_eq!(transport.fetched().len(), 1);
  }

  #[tokio::test]
  async fn test_clear_forgets_tokens() {
    let (cache, transport) = layer(Connectivity::Online);
    transport.push_fetch(VILLAGES, fresh("a", json!([])));
    transport.push_fetch(VILLAGES, fresh("b", json!([])));

    cache.read(VILLAGES).await.unwrap();
    cache.clear().unwrap();
    cache.read(VILLAGES).await.unwrap();

    assert_eq!(transport.fetched()[1].token, None);
  }
}
