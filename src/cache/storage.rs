//! Cache storage trait, SQLite implementation and an in-memory implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::CachedResponse;
use crate::http::{RequestKey, Response};

/// Trait for cache storage backends.
///
/// A backend holds named buckets, each a map from request identity to
/// response snapshot. Every method is atomic on its own; nothing serializes
/// a read followed by a write, so concurrent writers to one key race and the
/// last one wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create a bucket if it does not exist yet.
  fn create_bucket(&self, name: &str) -> Result<()>;

  fn has_bucket(&self, name: &str) -> Result<bool>;

  /// Bucket names in creation order.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Delete a bucket with all its entries. Returns false if there was none.
  fn delete_bucket(&self, name: &str) -> Result<bool>;

  /// Look up a single entry.
  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Snapshot digest of an entry, without loading the body.
  fn digest(&self, bucket: &str, key: &RequestKey) -> Result<Option<String>>;

  /// Insert or overwrite an entry. Fails if the bucket does not exist.
  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Request identities stored in a bucket, sorted.
  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  buckets: Mutex<Vec<MemoryBucket>>,
}

struct MemoryBucket {
  name: String,
  entries: BTreeMap<RequestKey, CachedResponse>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<MemoryBucket>>> {
    self
      .buckets
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn create_bucket(&self, name: &str) -> Result<()> {
    let mut buckets = self.lock()?;
    if !buckets.iter().any(|b| b.name == name) {
      buckets.push(MemoryBucket {
        name: name.to_string(),
        entries: BTreeMap::new(),
      });
    }
    Ok(())
  }

  fn has_bucket(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.iter().any(|b| b.name == name))
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.iter().map(|b| b.name.clone()).collect())
  }

  fn delete_bucket(&self, name: &str) -> Result<bool> {
    let mut buckets = self.lock()?;
    let before = buckets.len();
    buckets.retain(|b| b.name != name);
    Ok(buckets.len() != before)
  }

  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .lock()?
        .iter()
        .find(|b| b.name == bucket)
        .and_then(|b| b.entries.get(key))
        .cloned(),
    )
  }

  fn digest(&self, bucket: &str, key: &RequestKey) -> Result<Option<String>> {
    Ok(self.get(bucket, key)?.map(|entry| entry.digest))
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut buckets = self.lock()?;
    let target = buckets
      .iter_mut()
      .find(|b| b.name == bucket)
      .ok_or_else(|| eyre!("Cache bucket '{}' does not exist", bucket))?;

    target.entries.insert(
      key.clone(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
        digest: response.digest(),
      },
    );
    Ok(())
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    Ok(
      self
        .lock()?
        .iter()
        .find(|b| b.name == bucket)
        .map(|b| b.entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (creating if needed) the database at `path`, or at the default
  /// location when no path is given.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named bucket; id preserves creation order
CREATE TABLE IF NOT EXISTS buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request identity
CREATE TABLE IF NOT EXISTS entries (
    bucket_id INTEGER NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket_id, request_key)
);
"#;

fn bucket_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
  conn
    .query_row("SELECT id FROM buckets WHERE name = ?", params![name], |row| {
      row.get(0)
    })
    .optional()
    .map_err(|e| eyre!("Failed to look up cache bucket '{}': {}", name, e))
}

impl CacheStorage for SqliteStorage {
  fn create_bucket(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create cache bucket '{}': {}", name, e))?;
    Ok(())
  }

  fn has_bucket(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    Ok(bucket_id(&conn, name)?.is_some())
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let Some(id) = bucket_id(&conn, name)? else {
      return Ok(false);
    };

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute("DELETE FROM entries WHERE bucket_id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete entries of '{}': {}", name, e))?;
    tx.execute("DELETE FROM buckets WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete cache bucket '{}': {}", name, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(String, u16, String, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT e.url, e.status, e.status_text, e.headers, e.body, e.digest, e.cached_at
         FROM entries e
         INNER JOIN buckets b ON b.id = e.bucket_id
         WHERE b.name = ? AND e.request_key = ?",
        params![bucket, key.to_string()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let Some((url, status, status_text, headers, body, digest, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;

    Ok(Some(CachedResponse {
      response: Response {
        url,
        status,
        status_text,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
      digest,
    }))
  }

  fn digest(&self, bucket: &str, key: &RequestKey) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT e.digest FROM entries e
         INNER JOIN buckets b ON b.id = e.bucket_id
         WHERE b.name = ? AND e.request_key = ?",
        params![bucket, key.to_string()],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read digest of {}: {}", key, e))
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    let id = bucket_id(&conn, bucket)?
      .ok_or_else(|| eyre!("Cache bucket '{}' does not exist", bucket))?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers of {}: {}", key, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries
           (bucket_id, request_key, url, status, status_text, headers, body, digest, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          id,
          key.to_string(),
          response.url,
          response.status,
          response.status_text,
          headers,
          response.body,
          response.digest(),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT e.request_key FROM entries e
         INNER JOIN buckets b ON b.id = e.bucket_id
         WHERE b.name = ?
         ORDER BY e.request_key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![bucket], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to list entries of '{}': {}", bucket, e))?
      .filter_map(|r| r.ok())
      .filter_map(|raw| RequestKey::parse(&raw))
      .collect();

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
