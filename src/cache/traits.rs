//! Core types for the read cache.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::api::{Method, TransportError};

/// Identity of a cached request: method plus resolved URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: Method,
  pub url: String,
}

impl RequestKey {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      url: url.into(),
    }
  }

  pub fn identity(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  /// SHA256 of the identity, for a stable fixed-length primary key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.identity().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Revalidation metadata and last known-good body for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: RequestKey,
  /// Last server-issued ETag, sent back as `If-None-Match`
  pub token: Option<String>,
  pub payload: Value,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// The server confirmed the cached copy is current.
  pub fn revalidated(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Revalidated,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn from_cache(&self) -> bool {
    self.source != CacheSource::Network
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh body from the network
  Network,
  /// Server answered 304; cached body reused
  Revalidated,
  /// Network unavailable, serving the last known-good body
  Offline,
}

/// Why a read produced no data.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadError {
  #[error("offline and nothing cached")]
  Offline,
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("request failed with status {status}: {message}")]
  Rejected { status: u16, message: String },
}
