//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::metadata::CacheMetadata;
use super::traits::{HttpResponse, RequestIdentity};
use crate::db;

/// A cached response together with its metadata record.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: HttpResponse,
  /// `None` when the stored metadata is missing or unreadable
  pub metadata: Option<CacheMetadata>,
}

/// Size and age of one stored entry, used by the eviction sweep.
#[derive(Debug, Clone)]
pub struct EntrySummary {
  pub key: String,
  pub description: String,
  pub size_bytes: u64,
  /// Raw timestamp column, kept so deletes can check the row was not rewritten
  pub written_at_ms: Option<i64>,
  pub metadata: Option<CacheMetadata>,
}

/// Trait for cache storage backends.
///
/// Implementations must be safe to call from concurrent request tasks.
/// Simultaneous writes to the same key resolve as last-writer-wins.
pub trait CacheStorage: Send + Sync {
  /// Register a region name so it shows up in `region_names`.
  fn open_region(&self, region_name: &str) -> Result<()>;

  /// All persisted region names, including ones from older generations.
  fn region_names(&self) -> Result<Vec<String>>;

  /// Drop a region and every entry in it.
  fn delete_region(&self, region_name: &str) -> Result<bool>;

  fn get(&self, region_name: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Insert or replace the entry for `identity`, metadata included.
  fn put(
    &self,
    region_name: &str,
    identity: &RequestIdentity,
    response: &HttpResponse,
    metadata: &CacheMetadata,
  ) -> Result<()>;

  fn delete(&self, region_name: &str, key: &str) -> Result<bool>;

  /// Delete only if the entry still carries `written_at_ms`.
  fn delete_if_written_at(
    &self,
    region_name: &str,
    key: &str,
    written_at_ms: Option<i64>,
  ) -> Result<bool>;

  /// Entries of a region in insertion order.
  fn entries(&self, region_name: &str) -> Result<Vec<EntrySummary>>;

  /// Total body bytes stored in a region.
  fn region_size(&self, region_name: &str) -> Result<u64>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open_region(&self, _region_name: &str) -> Result<()> {
    Ok(())
  }

  fn region_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_region(&self, _region_name: &str) -> Result<bool> {
    Ok(false)
  }

  fn get(&self, _region_name: &str, _key: &str) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(
    &self,
    _region_name: &str,
    _identity: &RequestIdentity,
    _response: &HttpResponse,
    _metadata: &CacheMetadata,
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _region_name: &str, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_if_written_at(
    &self,
    _region_name: &str,
    _key: &str,
    _written_at_ms: Option<i64>,
  ) -> Result<bool> {
    Ok(false)
  }

  fn entries(&self, _region_name: &str) -> Result<Vec<EntrySummary>> {
    Ok(Vec::new())
  }

  fn region_size(&self, _region_name: &str) -> Result<u64> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Open the cache database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&db::default_path("cache.db")?)
  }

  /// Volatile storage, mostly useful for tests.
  pub fn in_memory() -> Result<Self> {
    let conn = db::open_in_memory(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Blank out the metadata columns of an entry, as left behind by a failed write.
  #[cfg(test)]
  pub(crate) fn strip_metadata(&self, region_name: &str, key: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE cache_entries SET written_at_ms = NULL, meta_region = NULL, expiry_ms = NULL
         WHERE region_name = ? AND request_key = ?",
        params![region_name, key],
      )
      .map_err(|e| eyre!("Failed to strip metadata: {}", e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Known regions, so stale generations can be found and dropped
CREATE TABLE IF NOT EXISTS cache_regions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response payload plus co-located metadata columns
CREATE TABLE IF NOT EXISTS cache_entries (
    region_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    request_description TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    size_bytes INTEGER NOT NULL,
    written_at_ms INTEGER,
    meta_region TEXT,
    expiry_ms INTEGER,
    PRIMARY KEY (region_name, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_written
    ON cache_entries(region_name, written_at_ms);
"#;

impl CacheStorage for SqliteStorage {
  fn open_region(&self, region_name: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_regions (name) VALUES (?)",
        params![region_name],
      )
      .map_err(|e| eyre!("Failed to open region {}: {}", region_name, e))?;
    Ok(())
  }

  fn region_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT name FROM cache_regions
         UNION SELECT DISTINCT region_name FROM cache_entries
         ORDER BY 1",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list regions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read region name: {}", e))?;

    Ok(names)
  }

  fn delete_region(&self, region_name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let entries = tx
      .execute(
        "DELETE FROM cache_entries WHERE region_name = ?",
        params![region_name],
      )
      .map_err(|e| eyre!("Failed to delete region entries: {}", e))?;
    let regions = tx
      .execute(
        "DELETE FROM cache_regions WHERE name = ?",
        params![region_name],
      )
      .map_err(|e| eyre!("Failed to delete region: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(entries + regions > 0)
  }

  fn get(&self, region_name: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, written_at_ms, meta_region, expiry_ms
         FROM cache_entries WHERE region_name = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type Row = (u16, String, Vec<u8>, Option<i64>, Option<String>, Option<i64>);
    let row: Option<Row> = stmt
      .query_row(params![region_name, key], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((status, headers, body, written_at_ms, meta_region, expiry_ms)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

    Ok(Some(CachedResponse {
      response: HttpResponse {
        status,
        headers,
        body,
      },
      metadata: CacheMetadata::decode(written_at_ms, meta_region.as_deref(), expiry_ms),
    }))
  }

  fn put(
    &self,
    region_name: &str,
    identity: &RequestIdentity,
    response: &HttpResponse,
    metadata: &CacheMetadata,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_regions (name) VALUES (?)",
      params![region_name],
    )
    .map_err(|e| eyre!("Failed to open region {}: {}", region_name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (region_name, request_key, request_description, status, headers, body,
          size_bytes, written_at_ms, meta_region, expiry_ms)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        region_name,
        identity.key,
        identity.description,
        response.status,
        headers,
        response.body,
        response.size_bytes() as i64,
        metadata.written_at_ms,
        metadata.region.as_str(),
        metadata.expiry_ms,
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, region_name: &str, key: &str) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE region_name = ? AND request_key = ?",
        params![region_name, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(deleted > 0)
  }

  fn delete_if_written_at(
    &self,
    region_name: &str,
    key: &str,
    written_at_ms: Option<i64>,
  ) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries
         WHERE region_name = ? AND request_key = ? AND written_at_ms IS ?",
        params![region_name, key, written_at_ms],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(deleted > 0)
  }

  fn entries(&self, region_name: &str) -> Result<Vec<EntrySummary>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT request_key, request_description, size_bytes, written_at_ms, meta_region, expiry_ms
         FROM cache_entries WHERE region_name = ?
         ORDER BY rowid",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let entries = stmt
      .query_map(params![region_name], |row| {
        let written_at_ms: Option<i64> = row.get(3)?;
        let meta_region: Option<String> = row.get(4)?;
        let expiry_ms: Option<i64> = row.get(5)?;
        Ok(EntrySummary {
          key: row.get(0)?,
          description: row.get(1)?,
          size_bytes: row.get::<_, i64>(2)? as u64,
          written_at_ms,
          metadata: CacheMetadata::decode(written_at_ms, meta_region.as_deref(), expiry_ms),
        })
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    Ok(entries)
  }

  fn region_size(&self, region_name: &str) -> Result<u64> {
    let size: i64 = self
      .conn()?
      .query_row(
        "SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries WHERE region_name = ?",
        params![region_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to compute region size: {}", e))?;
    Ok(size as u64)
  }
}
