//! The cache lifecycle manager: one worker per deployed version.
//!
//! - `install` pre-caches the asset manifest, then asks to skip waiting
//! - `activate` drops buckets of other versions, then claims open clients
//! - `fetch` serves GETs stale-while-revalidate

mod interceptor;
mod provisioner;
mod reconciler;

pub use interceptor::Interceptor;
pub use provisioner::{ProvisionReport, Provisioner};
pub use reconciler::Reconciler;

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheStorage, Caches};
use crate::config::WorkerConfig;
use crate::event::{ActivateEvent, FetchEvent, InstallEvent};
use crate::http::Network;

pub struct Worker<S: CacheStorage, N: Network> {
  config: Arc<WorkerConfig>,
  caches: Caches<S>,
  provisioner: Provisioner<S, N>,
  reconciler: Reconciler<S>,
  interceptor: Interceptor<S, N>,
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn new(config: WorkerConfig, storage: Arc<S>, network: Arc<N>) -> Self {
    let config = Arc::new(config);
    let caches = Caches::new(storage);
    Self {
      provisioner: Provisioner::new(config.clone(), caches.clone(), network.clone()),
      reconciler: Reconciler::new(config.clone(), caches.clone()),
      interceptor: Interceptor::new(config.clone(), caches.clone(), network),
      caches,
      config,
    }
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  /// Version tag, which is also the name of the current bucket.
  pub fn version(&self) -> &str {
    &self.config.cache_name
  }

  pub fn provisioner(&self) -> &Provisioner<S, N> {
    &self.provisioner
  }

  pub fn reconciler(&self) -> &Reconciler<S> {
    &self.reconciler
  }

  /// Whether this version's bucket exists, i.e. an install ran before.
  pub fn is_installed(&self) -> Result<bool> {
    self.caches.has(self.version())
  }

  pub fn on_install(&self, event: &InstallEvent) {
    let provisioner = self.provisioner.clone();
    let skip_waiting = event.skip_waiting();
    event.event.wait_until(async move {
      let report = provisioner.provision().await?;
      if report.is_complete() {
        info!(stored = report.stored.len(), unchanged = report.unchanged.len(), "Install complete");
      } else {
        warn!(
          stored = report.stored.len(),
          unchanged = report.unchanged.len(),
          failed = report.failed.len(),
          "Install complete with missing assets"
        );
      }
      skip_waiting.raise();
      Ok(())
    });
  }

  pub fn on_activate(&self, event: &ActivateEvent) {
    let reconciler = self.reconciler.clone();
    let claim = event.claim_clients();
    event.event.wait_until(async move {
      reconciler.reconcile()?;
      claim.raise();
      Ok(())
    });
  }

  /// Take over GET requests; anything else is left to the host.
  pub fn on_fetch(&self, event: &mut FetchEvent) {
    if !event.request().is_get() {
      return;
    }
    let interceptor = self.interceptor.clone();
    let request = event.request().clone();
    let url = request.url.clone();
    let lifetime = event.event.lifetime();
    let answer = async move { interceptor.respond(request, lifetime).await };
    if let Err(e) = event.respond_with(answer) {
      warn!(%url, error = %e, "Request already answered, keeping the first response");
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for Worker<S, N> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      caches: self.caches.clone(),
      provisioner: self.provisioner.clone(),
      reconciler: self.reconciler.clone(),
      interceptor: self.interceptor.clone(),
    }
  }
}
