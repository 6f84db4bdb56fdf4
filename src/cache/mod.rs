//! Persistent request/response buckets.
//!
//! This module provides the storage side of the worker:
//! - Named buckets, one per deployed version
//! - Response snapshots keyed by request identity (method + URL)
//! - A SQLite backend for persistence and an in-memory backend

mod bucket;
mod storage;
mod traits;

pub use bucket::{Cache, Caches, PutOutcome};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedResponse};
