//! Network seam between the sync core and the HTTP API.

use std::future::Future;
use thiserror::Error;

use super::types::{ApiResponse, FetchResponse, Operation};

/// A request that never produced an HTTP status.
///
/// Everything but `InvalidRequest` is worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("server unreachable: {0}")]
  Unreachable(String),
  #[error("request timed out")]
  Timeout,
  #[error("malformed response: {0}")]
  Protocol(String),
  /// The request could not be built, so it was never sent
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl TransportError {
  pub fn is_retryable(&self) -> bool {
    !matches!(self, Self::InvalidRequest(_))
  }
}

/// Abstraction over the API client so the queue and cache can run against a
/// scripted transport in tests.
pub trait Transport: Send + Sync + 'static {
  /// Send a queued write.
  fn send(
    &self,
    operation: &Operation,
  ) -> impl Future<Output = Result<ApiResponse, TransportError>> + Send;

  /// Conditional GET of `path`, attaching `token` as `If-None-Match` when given.
  fn fetch(
    &self,
    path: &str,
    token: Option<&str>,
  ) -> impl Future<Output = Result<FetchResponse, TransportError>> + Send;

  /// Cheap reachability check used by the connectivity prober.
  fn probe(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

  /// Resolve a path into the absolute URL used as cache identity.
  fn resolve(&self, path: &str) -> String;
}
