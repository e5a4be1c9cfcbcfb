//! Tracing setup: a daily-rolling log file, plus stderr when verbose.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Keep the returned guard alive
/// until exit or buffered lines are lost.
pub fn init(config: &Config, verbose: bool) -> Result<WorkerGuard> {
  let directory = match &config.log.directory {
    Some(dir) => dir.clone(),
    None => Config::data_dir()?,
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, "plantit-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.log.level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.log.level, e))?;

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false)))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
