//! Named buckets on top of a storage backend.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use super::storage::CacheStorage;
use super::traits::CachedResponse;
use crate::http::{Request, RequestKey, Response};

/// Entry point to every bucket of a storage backend.
pub struct Caches<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> Caches<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  /// Open a bucket, creating it if absent.
  pub fn open(&self, name: &str) -> Result<Cache<S>> {
    self.storage.create_bucket(name)?;
    Ok(Cache {
      storage: Arc::clone(&self.storage),
      name: name.to_string(),
    })
  }

  /// Handle to an existing bucket; never creates one.
  pub fn get(&self, name: &str) -> Result<Option<Cache<S>>> {
    if !self.storage.has_bucket(name)? {
      return Ok(None);
    }
    Ok(Some(Cache {
      storage: Arc::clone(&self.storage),
      name: name.to_string(),
    }))
  }

  pub fn has(&self, name: &str) -> Result<bool> {
    self.storage.has_bucket(name)
  }

  /// Bucket names in creation order.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.bucket_names()
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete_bucket(name)
  }
}

impl<S: CacheStorage> Clone for Caches<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

/// Outcome of writing a response that may already be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
  Stored,
  /// Identical snapshot already cached under this identity, nothing written
  Unchanged,
}

/// Handle to a single bucket.
pub struct Cache<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> Cache<S> {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>> {
    if !request.is_get() {
      return Ok(None);
    }
    self.match_key(&request.key())
  }

  pub fn match_key(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.storage.get(&self.name, key)
  }

  /// Store `response` under the identity of `request`, overwriting any entry.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    let key = cacheable_key(request)?;
    self.storage.put(&self.name, &key, response)
  }

  /// Like `put`, but skips the write when the stored snapshot (status,
  /// headers and body) is identical.
  pub fn put_if_changed(&self, request: &Request, response: &Response) -> Result<PutOutcome> {
    let key = cacheable_key(request)?;
    if self.storage.digest(&self.name, &key)?.as_deref() == Some(response.digest().as_str()) {
      return Ok(PutOutcome::Unchanged);
    }
    self.storage.put(&self.name, &key, response)?;
    Ok(PutOutcome::Stored)
  }

  pub fn keys(&self) -> Result<Vec<RequestKey>> {
    self.storage.keys(&self.name)
  }
}

fn cacheable_key(request: &Request) -> Result<RequestKey> {
  if !request.is_get() {
    return Err(eyre!(
      "Refusing to cache {} {}: only GET requests can be stored",
      request.method,
      request.url
    ));
  }
  Ok(request.key())
}
