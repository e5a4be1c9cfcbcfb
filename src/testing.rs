//! Test doubles: a scripted transport and a hand-driven clock.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::api::{ApiResponse, FetchResponse, Operation, Transport, TransportError};
use crate::clock::Clock;
use crate::lock::lock;

/// One recorded write attempt.
#[derive(Debug, Clone)]
pub struct SentRequest {
  pub operation: Operation,
  pub at: tokio::time::Instant,
}

/// One recorded conditional read.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
  pub path: String,
  pub token: Option<String>,
}

/// Transport that replays scripted responses and records every call.
///
/// Unscripted writes succeed with `201` and echo the request body.
/// Unscripted reads fail as unreachable.
pub struct RecordingTransport {
  sends: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
  fetches: Mutex<HashMap<String, VecDeque<Result<FetchResponse, TransportError>>>>,
  reachable: AtomicBool,
  sent: Mutex<Vec<SentRequest>>,
  fetched: Mutex<Vec<FetchRequest>>,
  gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingTransport {
  pub fn new() -> Self {
    Self {
      sends: Mutex::new(VecDeque::new()),
      fetches: Mutex::new(HashMap::new()),
      reachable: AtomicBool::new(true),
      sent: Mutex::new(Vec::new()),
      fetched: Mutex::new(Vec::new()),
      gate: Mutex::new(None),
    }
  }

  pub fn push_send(&self, response: Result<ApiResponse, TransportError>) {
    lock(&self.sends).push_back(response);
  }

  pub fn push_fetch(&self, path: &str, response: Result<FetchResponse, TransportError>) {
    lock(&self.fetches)
      .entry(path.to_string())
      .or_default()
      .push_back(response);
  }

  /// Park every later `send` after it is recorded, one release per
  /// `notify_one` on the returned handle.
  pub fn hold_sends(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *lock(&self.gate) = Some(Arc::clone(&gate));
    gate
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn sent(&self) -> Vec<SentRequest> {
    lock(&self.sent).clone()
  }

  pub fn fetched(&self) -> Vec<FetchRequest> {
    lock(&self.fetched).clone()
  }
}

impl Transport for RecordingTransport {
  async fn send(&self, operation: &Operation) -> Result<ApiResponse, TransportError> {
    lock(&self.sent).push(SentRequest {
      operation: operation.clone(),
      at: tokio::time::Instant::now(),
    });
    let gate = lock(&self.gate).clone();
    if let Some(gate) = gate {
      gate.notified().await;
    }

    lock(&self.sends).pop_front().unwrap_or_else(|| {
      let body = operation
        .body
        .as_deref()
        .and_then(|b| serde_json::from_str(b).ok())
        .unwrap_or(Value::Null);
      Ok(ApiResponse::new(201, body))
    })
  }

  async fn fetch(&self, path: &str, token: Option<&str>) -> Result<FetchResponse, TransportError> {
    lock(&self.fetched).push(FetchRequest {
      path: path.to_string(),
      token: token.map(String::from),
    });

    lock(&self.fetches)
      .get_mut(path)
      .and_then(VecDeque::pop_front)
      .unwrap_or_else(|| Err(TransportError::Unreachable(format!("no response scripted for {}", path))))
  }

  async fn probe(&self) -> Result<(), TransportError> {
    if self.reachable.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(TransportError::Unreachable("probe failed".into()))
    }
  }

  fn resolve(&self, path: &str) -> String {
    format!("http://test.invalid{}", path)
  }
}

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self {
      now: Mutex::new(Utc::now()),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = lock(&self.now);
    *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *lock(&self.now)
  }
}
