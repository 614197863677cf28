mod app;
mod cache;
mod capture;
mod commands;
mod config;
mod error;
mod event;
mod logging;
mod network;
mod queue;
mod registry;
mod remote;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;

use network::{NetworkMonitor, TcpProbe};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first mutation queue and read cache for field project management")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./fieldsync.yaml, then $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Treat the server as unreachable: queue everything, serve reads from cache
  #[arg(long, global = true)]
  offline: bool,

  /// Debug-level logging for this crate
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.data_dir()?, args.verbose)?;

  // One probe up front; `watch` keeps probing in the background
  let (online, probe) = if args.offline {
    (false, None)
  } else {
    let probe = TcpProbe::new(
      config.probe_addr()?,
      Duration::from_millis(config.network.probe_timeout_ms),
      Duration::from_secs(config.network.probe_interval_secs.max(1)),
    );
    (probe.check().await, Some(probe))
  };
  let monitor = NetworkMonitor::new(online);

  commands::run(args.command, config, monitor, probe).await
}
