//! Activate-time removal of buckets left behind by earlier versions.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStorage, Caches};
use crate::config::WorkerConfig;

pub struct Reconciler<S: CacheStorage> {
  config: Arc<WorkerConfig>,
  caches: Caches<S>,
}

impl<S: CacheStorage> Reconciler<S> {
  pub fn new(config: Arc<WorkerConfig>, caches: Caches<S>) -> Self {
    Self { config, caches }
  }

  /// Delete every bucket not named for the current version.
  ///
  /// Nothing is migrated. Returns the names that were deleted.
  pub fn reconcile(&self) -> Result<Vec<String>> {
    let stale: Vec<String> = self
      .caches
      .keys()?
      .into_iter()
      .filter(|name| *name != self.config.cache_name)
      .collect();

    let mut deleted = Vec::with_capacity(stale.len());
    for name in stale {
      if self.caches.delete(&name)? {
        info!(cache = %name, "Deleted stale cache");
        deleted.push(name);
      }
    }

    Ok(deleted)
  }
}

impl<S: CacheStorage> Clone for Reconciler<S> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      caches: self.caches.clone(),
    }
  }
}
