//! Tracing setup.
//!
//! Logs go to a daily file under `<data_dir>/logs` so stdout stays free for
//! command output. `FIELDSYNC_LOG` takes an `EnvFilter` directive, e.g.
//! `FIELDSYNC_LOG=fieldsync=debug`.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. Keep the guard alive until exit or
/// buffered lines are lost.
pub fn init(data_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "fieldsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("FIELDSYNC_LOG")
    .unwrap_or_else(|_| EnvFilter::new(if verbose { "fieldsync=debug,info" } else { "info" }));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
