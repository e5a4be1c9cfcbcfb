use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::{header_pair, ApiClient, Method, Operation, Transport};
use crate::bus::Subscription;
use crate::cache::{CacheLayer, CacheSource, CacheStorage, MemoryStorage, NoopStorage, SqliteStorage};
use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::connectivity::{self, Connectivity, ConnectivitySignal};
use crate::queue::{
  self, DrainTrigger, MutationQueue, QueueEvent, QueueTopic, ResilientStore, UNSENT_STATUS,
};
use crate::reconcile::{Mutation, MutationOutcome, Notice, NoticeKind, Reconciler};
use crate::state::{ChangeKind, StateChange, StateStore, SyncStatus};

/// A write requested from the command line.
#[derive(Debug, Clone)]
pub struct WriteRequest {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
  /// Extra request headers, replayed with the write
  pub headers: Vec<(String, String)>,
  /// Read paths whose local state the write changes
  pub resources: Vec<String>,
}

/// Wired-up sync core: transport, queue, cache, state and reconciler.
pub struct App {
  config: Config,
  client: Arc<ApiClient>,
  signal: ConnectivitySignal,
  cache: CacheLayer<ApiClient>,
  reconciler: Reconciler<ApiClient>,
  triggers: Option<mpsc::UnboundedReceiver<DrainTrigger>>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let client = Arc::new(ApiClient::new(&config.server)?);
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    // Unknown until the first probe; nothing is sent before then.
    let signal = ConnectivitySignal::new(Connectivity::Offline);

    let store = ResilientStore::open(&config.queue_db_path()?);
    let (queue, triggers) = MutationQueue::new(
      Box::new(store),
      Arc::clone(&client),
      Arc::clone(&clock),
      config.queue.backoff()?,
      signal.clone(),
    );

    let storage = Self::open_cache(&config)?;
    let cache = CacheLayer::new(storage, Arc::clone(&client), signal.clone(), clock);
    let reconciler = Reconciler::new(queue, cache.clone(), StateStore::new());

    Ok(Self {
      config,
      client,
      signal,
      cache,
      reconciler,
      triggers: Some(triggers),
    })
  }

  fn open_cache(config: &Config) -> Result<Arc<dyn CacheStorage>> {
    if !config.cache.enabled {
      return Ok(Arc::new(NoopStorage));
    }
    let path = config.cache_db_path()?;
    Ok(match SqliteStorage::open(&path) {
      Ok(storage) => Arc::new(storage),
      Err(e) => {
        warn!(error = %e, path = %path.display(), "cache database unavailable, caching in memory");
        Arc::new(MemoryStorage::default())
      }
    })
  }

  fn queue(&self) -> &MutationQueue<ApiClient> {
    self.reconciler.queue()
  }

  async fn probe(&self) -> Connectivity {
    connectivity::probe_once(self.client.as_ref(), &self.signal).await
  }

  /// `get`: cached read of one path.
  pub async fn get(&self, path: &str) -> Result<()> {
    self.probe().await;
    let result = self
      .reconciler
      .load(path)
      .await
      .map_err(|e| eyre!("GET {} failed: {}", path, e))?;

    let origin = match result.source {
      CacheSource::Network => "network".to_string(),
      CacheSource::Revalidated => "cache (not modified)".to_string(),
      CacheSource::Offline => match result.cached_at {
        Some(at) => format!("cache (offline, stored {})", at.format("%Y-%m-%d %H:%M:%S")),
        None => "cache (offline)".to_string(),
      },
    };
    eprintln!("from {}", origin);
    println!("{}", pretty(&result.data));
    Ok(())
  }

  /// `enqueue`: apply a write optimistically, queue it and try one sync pass.
  pub async fn enqueue(&self, request: WriteRequest, wait: Duration) -> Result<()> {
    let online = self.probe().await == Connectivity::Online;

    // Seed local state so the provisional change has something to apply to.
    if online {
      for key in &request.resources {
        if let Err(e) = self.reconciler.load(key).await {
          warn!(%key, error = %e, "could not load resource before write");
        }
      }
    }

    let mut operation = Operation::new(request.method, request.path.clone());
    if let Some(body) = &request.body {
      operation = operation.with_json(body);
    }
    for (name, value) in &request.headers {
      operation = operation.with_header(name.as_str(), value.as_str());
    }

    let _rollbacks: Vec<Subscription> = request
      .resources
      .iter()
      .map(|key| {
        self
          .reconciler
          .state()
          .subscribe(key, |change: &StateChange| match change.kind {
            ChangeKind::RolledBack => {
              eprintln!("{} rolled back", change.key);
              if let Some(value) = &change.value {
                println!("{}", pretty(value));
              }
            }
            ChangeKind::StatusChanged if change.status == SyncStatus::Synced => {
              eprintln!("{} synced", change.key);
            }
            _ => {}
          })
      })
      .collect();

    let handle = self.reconciler.mutate(
      Mutation::new(operation, request.resources.clone()),
      |state| apply_provisional(state, &request),
    )?;
    let id = handle.id();

    if !handle.receipt.durable {
      eprintln!("warning: queue storage unavailable, this write will not survive a restart");
    }
    for key in &request.resources {
      if let Some(value) = self.reconciler.state().get(key) {
        eprintln!("{} (pending sync)", key);
        println!("{}", pretty(&value));
      }
    }

    if !handle.receipt.online {
      println!(
        "queued {} at {} (offline)",
        id,
        handle.receipt.created_at.format("%Y-%m-%d %H:%M:%S")
      );
      return Ok(());
    }

    self.queue().drain().await;
    let still_queued = self
      .queue()
      .pending()?
      .iter()
      .any(|pending| pending.entry.id == id);
    if still_queued {
      println!("queued {} (pending sync, will retry)", id);
      return Ok(());
    }

    match tokio::time::timeout(wait, handle.outcome()).await {
      Ok(Some(MutationOutcome::Delivered { payload })) => {
        println!("delivered {}", id);
        println!("{}", pretty(&payload));
        Ok(())
      }
      Ok(Some(MutationOutcome::Rejected { status, message })) if status == UNSENT_STATUS => {
        Err(eyre!("not sent: {}", message))
      }
      Ok(Some(MutationOutcome::Rejected { status, message })) => {
        Err(eyre!("rejected by server ({}): {}", status, message))
      }
      Ok(None) => Err(eyre!("sync stopped before {} finished", id)),
      Err(_) => {
        println!("delivered {} (refresh still running)", id);
        Ok(())
      }
    }
  }

  /// `sync`: probe, then one drain pass.
  pub async fn sync(&self) -> Result<()> {
    let _notices = self.print_notices();

    if self.probe().await == Connectivity::Offline {
      let pending = self.queue().pending()?.len();
      println!("offline, {} mutation(s) pending", pending);
      return Ok(());
    }

    let report = self.queue().drain().await;
    if report.skipped {
      println!("another sync pass is already running");
      return Ok(());
    }
    let remaining = self.queue().pending()?.len();
    println!(
      "delivered {}, rejected {}, retrying {}, {} pending",
      report.delivered, report.rejected, report.retried, remaining
    );
    if let Some(wake) = self.queue().next_wake() {
      println!("next retry at {}", wake.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
  }

  /// `pending`: list queued mutations in replay order.
  pub fn pending(&self) -> Result<()> {
    if !self.queue().is_durable() {
      eprintln!("warning: queue storage unavailable, showing this session only");
    }
    let entries = self.queue().pending()?;
    if entries.is_empty() {
      println!("nothing pending");
      return Ok(());
    }

    for pending in entries {
      let entry = &pending.entry;
      println!(
        "{}  {:<15} {} {}  attempts={}  next={}",
        entry.id,
        format!("{:?}", pending.state),
        entry.operation.method,
        entry.operation.path,
        entry.attempts,
        entry.next_eligible_at.format("%Y-%m-%d %H:%M:%S"),
      );
      if let Some(error) = &entry.last_error {
        println!("    last error: {}", error);
      }
    }
    Ok(())
  }

  /// `watch`: run the sync worker and the prober until Ctrl-C.
  pub async fn watch(&mut self) -> Result<()> {
    let triggers = self
      .triggers
      .take()
      .ok_or_else(|| eyre!("sync worker already running"))?;

    let _notices = self.print_notices();
    let events = self.queue().events();
    let _delivered = events.subscribe(QueueTopic::Delivered, |event: &QueueEvent| {
      println!("delivered {}", event.id());
    });
    let _retries = events.subscribe(QueueTopic::RetryScheduled, |event: &QueueEvent| {
      if let QueueEvent::RetryScheduled {
        id,
        attempts,
        next_eligible_at,
        error,
        ..
      } = event
      {
        println!(
          "retry {} (attempt {}) at {}: {}",
          id,
          attempts,
          next_eligible_at.format("%H:%M:%S"),
          error
        );
      }
    });

    let interval = Duration::from_secs(self.config.connectivity.probe_interval_secs.max(1));
    let prober = tokio::spawn(connectivity::run_prober(
      Arc::clone(&self.client),
      self.signal.clone(),
      interval,
    ));
    let worker = tokio::spawn(queue::worker::run(
      self.queue().clone(),
      triggers,
      self.signal.clone(),
    ));
    info!(server = %self.client.resolve(""), "watching");
    println!("watching, Ctrl-C to stop");

    let result = tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e));

    prober.abort();
    worker.abort();
    result
  }

  /// `clear-cache`: forget every cached response.
  pub fn clear_cache(&self) -> Result<()> {
    self.cache.clear()?;
    println!("cache cleared");
    Ok(())
  }

  fn print_notices(&self) -> Subscription {
    self
      .reconciler
      .notices()
      .subscribe(NoticeKind::Rejected, |notice: &Notice| {
        eprintln!(
          "rejected {} ({}): {}",
          notice.id, notice.status, notice.message
        );
        if !notice.resources.is_empty() {
          eprintln!("    restored: {}", notice.resources.join(", "));
        }
      })
  }
}

/// Parse a request body given on the command line: inline JSON or `@file`.
pub fn parse_body(raw: &str) -> Result<Value> {
  let text = match raw.strip_prefix('@') {
    Some(file) => std::fs::read_to_string(Path::new(file))
      .map_err(|e| eyre!("Failed to read body file {}: {}", file, e))?,
    None => raw.to_string(),
  };
  serde_json::from_str(&text).map_err(|e| eyre!("Body is not valid JSON: {}", e))
}

/// Parse a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Header must look like 'Name: value', got '{}'", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Header name is empty in '{}'", raw));
  }
  let value = value.trim();
  header_pair(name, value).map_err(|e| eyre!(e))?;
  Ok((name.to_string(), value.to_string()))
}

fn pretty(value: &Value) -> String {
  serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Local guess at what the server will do with `request`.
///
/// The write's own path is treated as an item; any other resource holding an
/// array is treated as the collection containing it, matched on `id`.
pub fn apply_provisional(state: &StateStore, request: &WriteRequest) {
  let item_id = request
    .path
    .trim_end_matches('/')
    .rsplit('/')
    .next()
    .map(String::from);

  for key in &request.resources {
    let is_item = key.trim_end_matches('/') == request.path.trim_end_matches('/');
    state.update(key, |slot| match (request.method, is_item) {
      (Method::Delete, true) => *slot = None,
      (Method::Put, true) => {
        if let Some(body) = &request.body {
          *slot = Some(body.clone());
        }
      }
      (Method::Patch, true) => {
        if let (Some(current), Some(body)) = (slot.as_mut(), &request.body) {
          merge(current, body);
        }
      }
      (Method::Post, _) => {
        if let (Some(Value::Array(items)), Some(body)) = (slot.as_mut(), &request.body) {
          items.push(body.clone());
        }
      }
      (method, false) => {
        let Some(Value::Array(items)) = slot.as_mut() else {
          return;
        };
        let same_id = |item: &Value| item.get("id").and_then(Value::as_str) == item_id.as_deref();
        match (method, &request.body) {
          (Method::Delete, _) => items.retain(|item| !same_id(item)),
          (_, Some(body)) => {
            for item in items.iter_mut() {
              if !same_id(&*item) {
                continue;
              }
              if method == Method::Put {
                *item = body.clone();
              } else {
                merge(item, body);
              }
            }
          }
          (_, None) => {}
        }
      }
      (Method::Get, true) => {}
    });
  }
}

/// Shallow merge of `patch`'s fields into `target`, like a PATCH body.
fn merge(target: &mut Value, patch: &Value) {
  match (target, patch) {
    (Value::Object(fields), Value::Object(changes)) => {
      for (name, value) in changes {
        fields.insert(name.clone(), value.clone());
      }
    }
    (target, patch) => *target = patch.clone(),
  }
}
