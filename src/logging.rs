use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::LogConfig;

const DEFAULT_DIRECTIVE: &str = "offline_cache=info";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured filter. With `log.file` set, output
/// goes to that file through a background writer; keep the returned guard
/// alive until exit so buffered lines are flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = build_filter(config)?;

  let Some(path) = &config.file else {
    tracing_subscriber::registry()
      .with(env_filter)
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to install subscriber: {}", e))?;
    return Ok(None);
  };

  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| std::path::Path::new("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::registry()
    .with(env_filter)
    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install subscriber: {}", e))?;

  Ok(Some(guard))
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return Ok(filter);
  }
  let directives = config.filter.as_deref().unwrap_or(DEFAULT_DIRECTIVE);
  EnvFilter::try_new(directives).map_err(|e| eyre!("Invalid log filter '{}': {}", directives, e))
}
