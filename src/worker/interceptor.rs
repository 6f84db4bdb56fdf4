//! Per-request cache policy: stale-while-revalidate with an offline fallback
//! for navigations.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CacheStorage, CachedResponse, Caches};
use crate::config::WorkerConfig;
use crate::event::{Lifetime, Served};
use crate::http::{FetchError, Network, Request, Response};

pub struct Interceptor<S: CacheStorage, N: Network> {
  config: Arc<WorkerConfig>,
  caches: Caches<S>,
  network: Arc<N>,
}

impl<S: CacheStorage, N: Network> Interceptor<S, N> {
  pub fn new(config: Arc<WorkerConfig>, caches: Caches<S>, network: Arc<N>) -> Self {
    Self {
      config,
      caches,
      network,
    }
  }

  /// Answer a GET request.
  ///
  /// 1. Cache hit: return the stored snapshot now, refresh it in a task
  ///    registered on `lifetime`
  /// 2. Miss: go to the network, store a copy of any 200
  /// 3. Network failure on a navigation: serve the cached root document
  /// 4. Otherwise the failure reaches the caller
  pub async fn respond(&self, request: Request, lifetime: Lifetime) -> Result<Served, FetchError> {
    let key = request.key();

    if let Some(cached) = self.lookup(&request) {
      debug!(%key, "Cache hit");
      let refresher = self.clone();
      lifetime.wait_until(async move {
        refresher.revalidate(request).await;
        Ok(())
      });
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    match self.network.fetch(&request).await {
      Ok(response) => {
        if response.is_cacheable() {
          self.store(&request, &response);
        } else {
          debug!(%key, status = response.status, "Not caching non-200 response");
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        if request.is_navigation() {
          let root_request = Request::get(self.config.root_document.clone());
          if let Some(root) = self.lookup(&root_request) {
            info!(url = %request.url, error = %e, "Offline, serving cached root document");
            return Ok(CacheResult::offline(root.response, root.cached_at));
          }
        }
        Err(e)
      }
    }
  }

  /// Refresh an entry after it was served from cache.
  ///
  /// The caller already has its response, so nothing here is reported.
  async fn revalidate(&self, request: Request) {
    let Ok(response) = self.network.fetch(&request).await else {
      return;
    };
    if !response.is_cacheable() {
      return;
    }
    if let Ok(Some(cache)) = self.caches.get(&self.config.cache_name) {
      let _ = cache.put(&request, &response);
    }
  }

  fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    let found = self
      .caches
      .get(&self.config.cache_name)
      .and_then(|cache| match cache {
        Some(cache) => cache.match_request(request),
        None => Ok(None),
      });

    match found {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Cache lookup failed, treating as miss");
        None
      }
    }
  }

  fn store(&self, request: &Request, response: &Response) {
    // Written from a clone; the caller keeps the original.
    let copy = response.clone();
    let outcome = self
      .caches
      .get(&self.config.cache_name)
      .and_then(|cache| match cache {
        Some(cache) => cache.put(request, &copy).map(|_| true),
        None => Ok(false),
      });

    match outcome {
      Ok(true) => debug!(url = %request.url, "Cached network response"),
      Ok(false) => debug!(
        cache = %self.config.cache_name,
        "Current cache is gone, response not stored"
      ),
      Err(e) => warn!(url = %request.url, error = %e, "Failed to cache network response"),
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for Interceptor<S, N> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      caches: self.caches.clone(),
      network: Arc::clone(&self.network),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage, SqliteStorage};
  use crate::event::ExtendableEvent;
  use crate::http::Destination;
  use crate::testing::{url, worker_config, FakeNetwork};
  use chrono::Utc;
  use std::time::Duration;

  struct Fixture {
    interceptor: Interceptor<MemoryStorage, FakeNetwork>,
    caches: Caches<MemoryStorage>,
    network: Arc<FakeNetwork>,
  }

  fn fixture() -> Fixture {
    let caches = Caches::new(Arc::new(MemoryStorage::new()));
    caches.open("app-v1").unwrap();
    let network = FakeNetwork::new();
    let interceptor = Interceptor::new(
      Arc::new(worker_config("app-v1")),
      caches.clone(),
      network.clone(),
    );
    Fixture {
      interceptor,
      caches,
      network,
    }
  }

  impl Fixture {
    fn seed(&self, request: &Request, body: &str) {
      let cache = self.caches.open("app-v1").unwrap();
      cache.put(request, &Response::new(200, body)).unwrap();
    }

    fn stored(&self, request: &Request) -> Option<Vec<u8>> {
      self
        .caches
        .open("app-v1")
        .unwrap()
        .match_request(request)
        .unwrap()
        .map(|entry| entry.response.body)
    }

    async fn respond(&self, request: &Request) -> (Result<Served, FetchError>, ExtendableEvent) {
      let event = ExtendableEvent::new();
      let result = self
        .interceptor
        .respond(request.clone(), event.lifetime())
        .await;
      (result, event)
    }
  }

  #[tokio::test]
  async fn test_hit_returns_without_waiting_for_network() {
    let fx = fixture();
    let request = Request::get(url("app.js"));
    fx.seed(&request, "cached");
    let gate = fx.network.gate(&request.url);
    fx.network.serve(&request.url, "fresh");

    let event = ExtendableEvent::new();
    let served = tokio::time::timeout(
      Duration::from_millis(200),
      fx.interceptor.respond(request.clone(), event.lifetime()),
    )
    .await
    .expect("cache hit must not wait for the network")
    .unwrap();

    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.data.body, b"cached".to_vec());
    assert!(served.cached_at.is_some());

    // Refresh completes only once the network answers
    gate.notify_one();
    event.settled().await.unwrap();
    assert_eq!(fx.stored(&request), Some(b"fresh".to_vec()));
    assert_eq!(fx.network.calls(&request.url), 1);
  }

  #[tokio::test]
  async fn test_hung_refresh_never_settles_or_writes() {
    let fx = fixture();
    let request = Request::get(url("app.js"));
    fx.seed(&request, "cached");
    let _gate = fx.network.gate(&request.url);
    fx.network.serve(&request.url, "fresh");

    let (result, event) = fx.respond(&request).await;
    assert_eq!(result.unwrap().data.body, b"cached".to_vec());

    let pending = tokio::time::timeout(Duration::from_millis(50), event.settled()).await;
    assert!(pending.is_err());
    assert_eq!(fx.stored(&request), Some(b"cached".to_vec()));
  }

  #[tokio::test]
  async fn test_refresh_failure_is_silent() {
    let fx = fixture();
    let request = Request::get(url("app.js"));
    fx.seed(&request, "cached");
    fx.network.set_offline(true);

    let (result, event) = fx.respond(&request).await;
    assert_eq!(result.unwrap().data.body, b"cached".to_vec());

    event.settled().await.unwrap();
    assert_eq!(fx.stored(&request), Some(b"cached".to_vec()));
  }

  #[tokio::test]
  async fn test_refresh_ignores_error_status() {
    let fx = fixture();
    let request = Request::get(url("app.js"));
    fx.seed(&request, "cached");
    fx.network
      .respond(&request.url, Response::new(500, "upstream broke"));

    let (result, event) = fx.respond(&request).await;
    assert_eq!(result.unwrap().source, CacheSource::Cache);

    event.settled().await.unwrap();
    assert_eq!(fx.stored(&request), Some(b"cached".to_vec()));
  }

  #[tokio::test]
  async fn test_miss_stores_and_returns_copy() {
    let fx = fixture();
    let request = Request::get(url("data.json"));
    fx.network.respond(
      &request.url,
      Response::new(200, "{\"a\":1}").with_header("Content-Type", "application/json"),
    );

    let (result, event) = fx.respond(&request).await;
    let served = result.unwrap();
    event.settled().await.unwrap();

    assert_eq!(served.source, CacheSource::Network);
    let stored = fx
      .caches
      .open("app-v1")
      .unwrap()
      .match_request(&request)
      .unwrap()
      .unwrap();
    assert_eq!(stored.response, served.data);
  }

  #[tokio::test]
  async fn test_miss_with_error_status_is_not_cached() {
    let fx = fixture();
    let request = Request::get(url("missing.png"));

    let (result, _event) = fx.respond(&request).await;
    let served = result.unwrap();

    assert_eq!(served.data.status, 404);
    assert_eq!(served.data.body, b"not found".to_vec());
    assert!(fx.stored(&request).is_none());
  }

  #[tokio::test]
  async fn test_offline_navigation_falls_back_to_root_document() {
    let fx = fixture();
    fx.seed(&Request::get(url("index.html")), "<html>root</html>");
    fx.network.set_offline(true);

    let request = Request::navigate(url("settings/profile"));
    let (result, _event) = fx.respond(&request).await;
    let served = result.unwrap();

    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.data.body, b"<html>root</html>".to_vec());
    assert!(fx.stored(&request).is_none());
  }

  #[tokio::test]
  async fn test_offline_navigation_without_root_fails() {
    let fx = fixture();
    fx.network.set_offline(true);

    let (result, _event) = fx.respond(&Request::navigate(url("settings"))).await;
    assert!(matches!(result, Err(FetchError::Transport { .. })));
  }

  #[tokio::test]
  async fn test_offline_subresource_has_no_fallback() {
    let fx = fixture();
    fx.seed(&Request::get(url("index.html")), "<html>root</html>");
    fx.network.set_offline(true);

    for destination in [Destination::Script, Destination::Image, Destination::Empty] {
      let request = Request::get(url("api/items")).with_destination(destination);
      let (result, _event) = fx.respond(&request).await;
      assert!(result.is_err(), "{destination:?} should fail");
    }
  }

  #[tokio::test]
  async fn test_missing_bucket_is_not_recreated() {
    let fx = fixture();
    fx.caches.delete("app-v1").unwrap();
    let request = Request::get(url("app.js"));
    fx.network.serve(&request.url, "fresh");

    let (result, _event) = fx.respond(&request).await;
    assert_eq!(result.unwrap().data.body, b"fresh".to_vec());
    assert!(!fx.caches.has("app-v1").unwrap());
  }

  #[tokio::test]
  async fn test_hit_and_refresh_on_sqlite() {
    let caches = Caches::new(Arc::new(SqliteStorage::open_in_memory().unwrap()));
    let cache = caches.open("app-v1").unwrap();
    let network = FakeNetwork::new();
    let interceptor = Interceptor::new(
      Arc::new(worker_config("app-v1")),
      caches.clone(),
      network.clone(),
    );

    let request = Request::get(url("manifest.json"));
    let manifest_type = "application/manifest+json";
    cache
      .put(
        &request,
        &Response::new(200, "{\"v\":1}").with_header("Content-Type", manifest_type),
      )
      .unwrap();
    network.respond(
      &request.url,
      Response::new(200, "{\"v\":2}").with_header("Content-Type", manifest_type),
    );

    let event = ExtendableEvent::new();
    let served = interceptor
      .respond(request.clone(), event.lifetime())
      .await
      .unwrap();

    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.data.body, b"{\"v\":1}".to_vec());
    assert_eq!(served.data.header("content-type"), Some(manifest_type));
    let age = Utc::now() - served.cached_at.unwrap();
    assert!(age.num_seconds().abs() < 60);

    event.settled().await.unwrap();
    let stored = cache.match_request(&request).unwrap().unwrap();
    assert_eq!(stored.response.body, b"{\"v\":2}".to_vec());
    assert_eq!(stored.response.header("content-type"), Some(manifest_type));
  }
}
