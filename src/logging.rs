//! Tracing setup for host applications.
//!
//! Mobile hosts have no useful stdout, so events go to a daily rolling file
//! through a non-blocking writer. Keep the returned guard alive for the
//! lifetime of the process or buffered lines are lost on exit.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};

const LOG_ENV: &str = "CARELINE_LOG";
const LOG_FILE_PREFIX: &str = "careline.log";

pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let directory = match &config.directory {
    Some(dir) => dir.clone(),
    None => Config::data_dir()?.join("logs"),
  };
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = env_filter(config.filter.as_deref())?;

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn env_filter(fallback: Option<&str>) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
    return Ok(filter);
  }
  EnvFilter::try_new(fallback.unwrap_or("info"))
    .map_err(|e| eyre!("Invalid log filter: {}", e))
}
