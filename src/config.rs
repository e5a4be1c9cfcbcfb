use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::BackoffSchedule;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Base URL of the Plantit API
  #[serde(default = "default_server_url")]
  pub url: String,
  /// Path probed to decide whether the server is reachable
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: default_server_url(),
      health_path: default_health_path(),
      request_timeout_secs: default_request_timeout(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Retry delays in milliseconds, indexed by attempt count. Must be non-decreasing;
  /// the last value is the cap.
  #[serde(default = "default_backoff_ms")]
  pub backoff_ms: Vec<u64>,
  /// Override for the queue database location
  pub database: Option<PathBuf>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      backoff_ms: default_backoff_ms(),
      database: None,
    }
  }
}

impl QueueConfig {
  pub fn backoff(&self) -> Result<BackoffSchedule> {
    let delays = self
      .backoff_ms
      .iter()
      .map(|ms| Duration::from_millis(*ms))
      .collect();
    BackoffSchedule::new(delays).map_err(|e| eyre!("Invalid queue.backoff_ms: {}", e))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// When false, reads always go to the network and nothing is stored
  #[serde(default = "default_true")]
  pub enabled: bool,
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: default_probe_interval(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Directory for rolling log files (default: data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_server_url() -> String {
  "http://127.0.0.1:8000".to_string()
}

fn default_health_path() -> String {
  "/api/health".to_string()
}

fn default_request_timeout() -> u64 {
  10
}

fn default_backoff_ms() -> Vec<u64> {
  vec![1_000, 2_000, 5_000, 15_000, 30_000, 60_000]
}

fn default_true() -> bool {
  true
}

fn default_probe_interval() -> u64 {
  15
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./plantit-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/plantit-sync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("plantit-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("plantit-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    // Reject a bad schedule at load time rather than on the first retry.
    config.queue.backoff()?;
    Ok(config)
  }

  /// Directory holding the queue database, cache database and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("plantit-sync"))
  }

  pub fn queue_db_path(&self) -> Result<PathBuf> {
    match &self.queue.database {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("queue.db")),
    }
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  /// Get the API token from environment variables.
  ///
  /// Checks PLANTIT_SYNC_TOKEN first, then PLANTIT_API_TOKEN as fallback.
  /// The API may run without authentication, so a missing token is not an error.
  pub fn get_api_token() -> Option<String> {
    std::env::var("PLANTIT_SYNC_TOKEN")
      .or_else(|_| std::env::var("PLANTIT_API_TOKEN"))
      .ok()
      .filter(|t| !t.is_empty())
  }
}
