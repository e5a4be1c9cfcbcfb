mod api;
mod app;
mod bus;
mod cache;
mod clock;
mod config;
mod connectivity;
mod db;
mod lock;
mod logging;
mod queue;
mod reconcile;
mod state;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::Method;
use crate::app::{parse_body, parse_header, App, WriteRequest};

#[derive(Parser, Debug)]
#[command(name = "plantit-sync")]
#[command(about = "Offline-first sync client for the Plantit API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/plantit-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Server base URL, overriding the config file
  #[arg(short, long)]
  server: Option<String>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read a path, revalidating against the cache
  Get { path: String },

  /// Apply a write locally and queue it for delivery
  Enqueue {
    /// HTTP method: POST, PUT, PATCH or DELETE
    method: Method,
    path: String,
    /// JSON body, or @file to read it from a file
    #[arg(short, long)]
    body: Option<String>,
    /// Extra header as 'Name: value' (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Read path whose local state this write changes (repeatable)
    #[arg(short, long = "resource")]
    resources: Vec<String>,
    /// Seconds to wait for the refresh after delivery
    #[arg(long, default_value_t = 10)]
    wait: u64,
  },

  /// Check connectivity and replay queued writes once
  Sync,

  /// List queued writes in replay order
  Pending,

  /// Keep syncing in the background until Ctrl-C
  Watch,

  /// Forget every cached response
  ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override server if specified on command line
  if let Some(server) = args.server {
    config.server.url = server;
  }

  let _log_guard = logging::init(&config, args.verbose)?;

  let mut app = App::new(config)?;
  match args.command {
    Command::Get { path } => app.get(&path).await,
    Command::Enqueue {
      method,
      path,
      body,
      headers,
      resources,
      wait,
    } => {
      let body = body.as_deref().map(parse_body).transpose()?;
      let headers = headers
        .iter()
        .map(|h| parse_header(h))
        .collect::<Result<Vec<_>>>()?;
      let request = WriteRequest {
        method,
        path,
        body,
        headers,
        resources,
      };
      app.enqueue(request, Duration::from_secs(wait)).await
    }
    Command::Sync => app.sync().await,
    Command::Pending => app.pending(),
    Command::Watch => app.watch().await,
    Command::ClearCache => app.clear_cache(),
  }
}
