//! Subcommands of the `swcache` binary.

use clap::{Args, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::cache::{CacheStorage, Caches};
use crate::config::WorkerConfig;
use crate::http::{Destination, HttpClient, Request};
use crate::runtime::{Runtime, WorkerState};
use crate::worker::{ProvisionReport, Worker};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Install the configured version and activate it
  Update,
  /// Pre-cache the asset manifest into the current bucket
  Install,
  /// Delete every bucket that does not belong to the configured version
  Activate,
  /// Send one request through the active worker
  Fetch(FetchArgs),
  /// List cache buckets
  Buckets,
  /// List cached requests of a bucket
  Entries {
    /// Bucket name (default: current version)
    bucket: Option<String>,
  },
}

#[derive(Args, Debug)]
pub struct FetchArgs {
  /// Absolute URL, or a path relative to the configured scope
  pub url: String,

  #[arg(short = 'X', long, default_value = "GET")]
  pub method: String,

  #[arg(short, long, value_enum, default_value_t = Destination::Empty)]
  pub destination: Destination,

  /// Extra request header, as "Name: value"
  #[arg(short = 'H', long = "header")]
  pub headers: Vec<String>,

  /// Write the body here instead of stdout
  #[arg(short, long)]
  pub output: Option<PathBuf>,
}

/// Everything a subcommand needs.
pub struct Context<S: CacheStorage> {
  pub config: WorkerConfig,
  pub storage: Arc<S>,
  pub network: Arc<HttpClient>,
}

impl<S: CacheStorage> Context<S> {
  fn worker(&self) -> Worker<S, HttpClient> {
    Worker::new(
      self.config.clone(),
      self.storage.clone(),
      self.network.clone(),
    )
  }
}

pub async fn run<S: CacheStorage>(ctx: &Context<S>, command: Command) -> Result<()> {
  match command {
    Command::Update => update(ctx).await,
    Command::Install => install(ctx).await,
    Command::Activate => activate(ctx),
    Command::Fetch(args) => fetch(ctx, args).await,
    Command::Buckets => buckets(ctx),
    Command::Entries { bucket } => entries(ctx, bucket.as_deref()),
  }
}

async fn update<S: CacheStorage>(ctx: &Context<S>) -> Result<()> {
  let mut runtime = Runtime::new(ctx.network.clone());
  let state = runtime.register(ctx.worker()).await?;

  match state {
    WorkerState::Activated => println!("{} is active", ctx.config.cache_name),
    _ => println!(
      "{} is installed and waiting (active: {})",
      runtime.waiting_version().unwrap_or(&ctx.config.cache_name),
      runtime.active_version().unwrap_or("none")
    ),
  }
  buckets(ctx)
}

async fn install<S: CacheStorage>(ctx: &Context<S>) -> Result<()> {
  let worker = ctx.worker();
  let report = worker.provisioner().provision().await?;
  print_report(&ctx.config.cache_name, &report);
  Ok(())
}

fn activate<S: CacheStorage>(ctx: &Context<S>) -> Result<()> {
  let worker = ctx.worker();
  let deleted = worker.reconciler().reconcile()?;
  if deleted.is_empty() {
    println!("No stale caches");
  }
  for name in deleted {
    println!("deleted {}", name);
  }
  Ok(())
}

async fn fetch<S: CacheStorage>(ctx: &Context<S>, args: FetchArgs) -> Result<()> {
  let mut runtime = Runtime::new(ctx.network.clone());
  runtime.resume(ctx.worker())?;
  let client = runtime.open_client(ctx.config.scope.clone());

  let request = build_request(&ctx.config.scope, &args)?;
  let url = request.url.clone();
  let dispatch = runtime.fetch(request, Some(client)).await;
  let served = dispatch
    .result
    .map_err(|e| eyre!("Fetch of {} failed: {}", url, e))?;

  match served.cached_at {
    Some(cached_at) => eprintln!(
      "{} {} ({}, cached {})",
      served.data.status,
      served.data.status_text,
      served.source,
      cached_at.format("%Y-%m-%d %H:%M:%S UTC")
    ),
    None => eprintln!(
      "{} {} ({})",
      served.data.status, served.data.status_text, served.source
    ),
  }
  match &args.output {
    Some(path) => std::fs::write(path, &served.data.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout()
      .write_all(&served.data.body)
      .map_err(|e| eyre!("Failed to write response body: {}", e))?,
  }

  // Let a background refresh finish before the process exits
  dispatch.pending.settled().await?;
  runtime.close_client(client).await
}

fn buckets<S: CacheStorage>(ctx: &Context<S>) -> Result<()> {
  for name in ctx.storage.bucket_names()? {
    let count = ctx.storage.keys(&name)?.len();
    let marker = if name == ctx.config.cache_name { "*" } else { " " };
    println!("{} {} ({} entries)", marker, name, count);
  }
  Ok(())
}

fn entries<S: CacheStorage>(ctx: &Context<S>, bucket: Option<&str>) -> Result<()> {
  let bucket = bucket.unwrap_or(&ctx.config.cache_name);
  let cache = Caches::new(ctx.storage.clone())
    .get(bucket)?
    .ok_or_else(|| eyre!("No cache bucket named '{}'", bucket))?;
  for key in cache.keys()? {
    println!("{}", key);
  }
  Ok(())
}

fn print_report(cache_name: &str, report: &ProvisionReport) {
  println!(
    "{}: {} stored, {} unchanged, {} failed",
    cache_name,
    report.stored.len(),
    report.unchanged.len(),
    report.failed.len()
  );
  for (url, error) in &report.failed {
    println!("  failed {}: {}", url, error);
  }
}

fn build_request(scope: &Url, args: &FetchArgs) -> Result<Request> {
  let url = scope
    .join(&args.url)
    .map_err(|e| eyre!("Invalid URL '{}': {}", args.url, e))?;
  let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", args.method, e))?;

  let mut request = Request::new(method, url).with_destination(args.destination);
  for header in &args.headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Header '{}' is not of the form \"Name: value\"", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  Ok(request)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args(url: &str) -> FetchArgs {
    FetchArgs {
      url: url.to_string(),
      method: "get".to_string(),
      destination: Destination::Document,
      headers: vec!["Accept: text/html".to_string()],
      output: None,
    }
  }

  #[test]
  fn test_build_request_resolves_against_scope() {
    let scope = Url::parse("https://tools.test/app/").unwrap();
    let request = build_request(&scope, &args("Matstools.html")).unwrap();

    assert_eq!(request.url.as_str(), "https://tools.test/app/Matstools.html");
    assert!(request.is_get());
    assert!(request.is_navigation());
    assert_eq!(
      request.headers,
      vec![("Accept".to_string(), "text/html".to_string())]
    );
  }

  #[test]
  fn test_build_request_keeps_absolute_urls() {
    let scope = Url::parse("https://tools.test/app/").unwrap();
    let request = build_request(&scope, &args("https://fonts.test/css2")).unwrap();
    assert_eq!(request.url.as_str(), "https://fonts.test/css2");
  }

  #[test]
  fn test_build_request_rejects_bad_header() {
    let scope = Url::parse("https://tools.test/app/").unwrap();
    let mut bad = args("index.html");
    bad.headers = vec!["no colon here".to_string()];
    assert!(build_request(&scope, &bad).is_err());
  }
}
