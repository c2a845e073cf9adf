mod cache;
mod classify;
mod commands;
mod config;
mod db;
mod error;
mod net;
mod queue;
mod relay;
mod request;
mod sync;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sfrelay")]
#[command(about = "Offline-first caching relay and retry queue for the storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sfrelay/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Directory for cache.db, queue.db and logs
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to stderr and to a daily file under `<data_dir>/logs`.
fn init_tracing(data_dir: &Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "sfrelay.log"));
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sfrelay=info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let data_dir = config::Config::data_dir(args.data_dir.as_deref())?;
  let _log_guard = init_tracing(&data_dir)?;

  let interval = Duration::from_secs(config.sync.interval_secs.max(1));
  let relay = relay::Relay::open(config, &data_dir)?;

  commands::run(&relay, args.command, interval).await
}
