//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, MemoryStorage};
use crate::config::WorkerConfig;
use crate::http::{FetchError, Network, Request, RequestKey, Response};

pub const SCOPE: &str = "https://tools.test/app/";

pub fn url(path: &str) -> Url {
  Url::parse(SCOPE).unwrap().join(path).unwrap()
}

/// A worker config for `version` with a small manifest under `SCOPE`.
pub fn worker_config(version: &str) -> WorkerConfig {
  WorkerConfig {
    cache_name: version.to_string(),
    scope: Url::parse(SCOPE).unwrap(),
    root_document: url("index.html"),
    manifest: vec![
      url("index.html"),
      url("manifest.json"),
      url("icon-192.png"),
      Url::parse("https://fonts.test/css2?family=Outfit").unwrap(),
    ],
    install_concurrency: 2,
  }
}

/// Scripted network: fixed responses per URL, unknown URLs answer 404.
#[derive(Default)]
pub struct FakeNetwork {
  state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
  routes: HashMap<String, Response>,
  failing: Vec<String>,
  gates: HashMap<String, Arc<Notify>>,
  offline: bool,
  calls: Vec<String>,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, url: &Url, response: Response) {
    let mut state = self.state.lock().unwrap();
    state.failing.retain(|u| u != url.as_str());
    state
      .routes
      .insert(url.to_string(), response.with_url(url.as_str()));
  }

  /// Shorthand for a 200 with `body`.
  pub fn serve(&self, url: &Url, body: &str) {
    self.respond(url, Response::new(200, body));
  }

  /// Transport failure for one URL.
  pub fn fail(&self, url: &Url) {
    self.state.lock().unwrap().failing.push(url.to_string());
  }

  /// Transport failure for every URL.
  pub fn set_offline(&self, offline: bool) {
    self.state.lock().unwrap().offline = offline;
  }

  /// Hold requests for `url` until the returned gate is notified.
  pub fn gate(&self, url: &Url) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self
      .state
      .lock()
      .unwrap()
      .gates
      .insert(url.to_string(), gate.clone());
    gate
  }

  pub fn calls(&self, url: &Url) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .calls
      .iter()
      .filter(|u| *u == url.as_str())
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.state.lock().unwrap().calls.len()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    let gate = {
      let mut state = self.state.lock().unwrap();
      state.calls.push(url.clone());
      state.gates.get(&url).cloned()
    };

    if let Some(gate) = gate {
      gate.notified().await;
    }

    let state = self.state.lock().unwrap();
    if state.offline || state.failing.contains(&url) {
      return Err(FetchError::transport(url, "connection refused"));
    }
    Ok(
      state
        .routes
        .get(&url)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found").with_url(url)),
    )
  }
}

/// In-memory storage whose bucket listing can be switched to fail.
#[derive(Default)]
pub struct FlakyStorage {
  inner: MemoryStorage,
  fail_listing: AtomicBool,
}

impl FlakyStorage {
  pub fn fail_listing(&self, fail: bool) {
    self.fail_listing.store(fail, Ordering::SeqCst);
  }
}

impl CacheStorage for FlakyStorage {
  fn create_bucket(&self, name: &str) -> Result<()> {
    self.inner.create_bucket(name)
  }

  fn has_bucket(&self, name: &str) -> Result<bool> {
    self.inner.has_bucket(name)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    if self.fail_listing.load(Ordering::SeqCst) {
      return Err(eyre!("disk I/O error"));
    }
    self.inner.bucket_names()
  }

  fn delete_bucket(&self, name: &str) -> Result<bool> {
    self.inner.delete_bucket(name)
  }

  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.inner.get(bucket, key)
  }

  fn digest(&self, bucket: &str, key: &RequestKey) -> Result<Option<String>> {
    self.inner.digest(bucket, key)
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.inner.put(bucket, key, response)
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    self.inner.keys(bucket)
  }
}
