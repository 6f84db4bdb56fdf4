mod cache;
mod commands;
mod config;
mod event;
mod http;
mod runtime;
mod worker;

#[cfg(test)]
mod testing;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{MemoryStorage, SqliteStorage};
use commands::{Command, Context};
use http::HttpClient;

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline-first request cache with an install/activate/fetch lifecycle")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swcache.yaml or $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Append logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Keep caches in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose, args.log_file.as_deref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let worker_config = config.worker_config()?;
  let network = Arc::new(HttpClient::new()?);

  if args.ephemeral {
    let ctx = Context {
      config: worker_config,
      storage: Arc::new(MemoryStorage::new()),
      network,
    };
    commands::run(&ctx, args.command).await
  } else {
    let storage = SqliteStorage::open(config.storage.path.as_deref())?;
    let ctx = Context {
      config: worker_config,
      storage: Arc::new(storage),
      network,
    };
    commands::run(&ctx, args.command).await
  }
}

fn init_tracing(verbose: bool, log_file: Option<&Path>) -> Result<WorkerGuard> {
  let default_filter = if verbose { "swcache=debug" } else { "swcache=info" };
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

  let (writer, guard) = match log_file {
    Some(path) => {
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name))
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_ansi(log_file.is_none())
    .with_writer(writer)
    .init();

  Ok(guard)
}
