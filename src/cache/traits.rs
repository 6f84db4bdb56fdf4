//! Core types for the caching system.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response snapshot as stored in a bucket.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the snapshot was written
  pub cached_at: DateTime<Utc>,
  /// Hex SHA-256 of the full snapshot, see `Response::digest`
  pub digest: String,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Data that never went through a worker.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched from the network by the worker
  Network,
  /// Served from the current bucket; a refresh may still be running
  Cache,
  /// Network unavailable, serving the cached root document instead
  Offline,
  /// Not handled by any worker, default network behavior
  Passthrough,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline fallback",
      Self::Passthrough => "passthrough",
    };
    f.write_str(label)
  }
}
