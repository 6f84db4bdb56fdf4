//! Install-time pre-caching of the asset manifest.

use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Cache, CacheStorage, Caches, PutOutcome};
use crate::config::WorkerConfig;
use crate::http::{Network, Request};

/// What happened to each manifest entry during install.
#[derive(Debug, Default)]
pub struct ProvisionReport {
  pub stored: Vec<Url>,
  /// Already cached with an identical body
  pub unchanged: Vec<Url>,
  pub failed: Vec<(Url, String)>,
}

impl ProvisionReport {
  pub fn is_complete(&self) -> bool {
    self.failed.is_empty()
  }
}

/// Fills the current bucket from the asset manifest.
pub struct Provisioner<S: CacheStorage, N: Network> {
  config: Arc<WorkerConfig>,
  caches: Caches<S>,
  network: Arc<N>,
}

impl<S: CacheStorage, N: Network> Provisioner<S, N> {
  pub fn new(config: Arc<WorkerConfig>, caches: Caches<S>, network: Arc<N>) -> Self {
    Self {
      config,
      caches,
      network,
    }
  }

  /// Fetch and store every manifest entry.
  ///
  /// Individual assets that fail are reported but never abort the install;
  /// only failing to open the bucket itself is an error.
  pub async fn provision(&self) -> Result<ProvisionReport> {
    let cache = self.caches.open(&self.config.cache_name)?;
    info!(
      cache = %cache.name(),
      assets = self.config.manifest.len(),
      "Pre-caching asset manifest"
    );

    let cache = &cache;
    let outcomes: Vec<(Url, Result<PutOutcome>)> = stream::iter(self.config.manifest.iter().cloned())
      .map(|url| async move {
        let outcome = self.cache_asset(cache, &url).await;
        (url, outcome)
      })
      .buffered(self.config.install_concurrency)
      .collect()
      .await;

    let mut report = ProvisionReport::default();
    for (url, outcome) in outcomes {
      match outcome {
        Ok(PutOutcome::Stored) => {
          debug!(%url, "Pre-cached");
          report.stored.push(url);
        }
        Ok(PutOutcome::Unchanged) => {
          debug!(%url, "Already cached, unchanged");
          report.unchanged.push(url);
        }
        Err(e) => {
          warn!(%url, error = %e, "Pre-cache failed; asset may be unavailable offline");
          report.failed.push((url, e.to_string()));
        }
      }
    }

    Ok(report)
  }

  async fn cache_asset(&self, cache: &Cache<S>, url: &Url) -> Result<PutOutcome> {
    let request = Request::get(url.clone());
    let response = self.network.fetch(&request).await?;
    if !response.is_cacheable() {
      return Err(eyre!(
        "Unexpected response status {} {}",
        response.status,
        response.status_text
      ));
    }
    cache.put_if_changed(&request, &response)
  }
}

impl<S: CacheStorage, N: Network> Clone for Provisioner<S, N> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      caches: self.caches.clone(),
      network: Arc::clone(&self.network),
    }
  }
}
