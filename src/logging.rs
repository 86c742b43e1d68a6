//! tracing setup for the command line front end.

use color_eyre::{eyre::eyre, Result};
use std::ffi::OsStr;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber: stderr always, plus a daily-rolling file
/// when configured. `OFFSYNC_LOG` overrides the configured level.
///
/// Keep the returned guard alive until exit or buffered file lines are lost.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_env("OFFSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(&config.level));

  let (file_layer, guard) = match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let prefix = path
        .file_name()
        .unwrap_or_else(|| OsStr::new("offsync.log"));
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix));
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false),
    )
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
