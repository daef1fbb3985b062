//! SQLite log backing the write queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::QueueItem;
use crate::db;

/// Schema for the queue table.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_type TEXT NOT NULL,
    data TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);
"#;

/// Durable FIFO log of pending writes, keyed by a monotonic id.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

impl SqliteQueue {
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn open_default() -> Result<Self> {
    Self::open(&db::default_path("queue.db")?)
  }

  pub fn in_memory() -> Result<Self> {
    let conn = db::open_in_memory(QUEUE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Append an item and return its id once the write is committed.
  pub fn append(&self, item_type: &str, data: &Value) -> Result<i64> {
    let data = serde_json::to_string(data).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT INTO offline_queue (item_type, data, enqueued_at) VALUES (?, ?, ?)",
        params![item_type, data, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue item: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  /// Every queued row, oldest first, each decoded on its own.
  ///
  /// A row whose payload or timestamp does not parse comes back as an
  /// error next to its id and stays in the table.
  pub fn scan(&self) -> Result<Vec<(i64, Result<QueueItem>)>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, item_type, data, enqueued_at FROM offline_queue ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue item: {}", e))?;

    Ok(
      rows
        .into_iter()
        .map(|(id, item_type, data, enqueued_at)| (id, to_item(id, item_type, &data, &enqueued_at)))
        .collect(),
    )
  }

  /// Every decodable item, oldest first.
  pub fn all(&self) -> Result<Vec<QueueItem>> {
    let items = self
      .scan()?
      .into_iter()
      .filter_map(|(id, item)| match item {
        Ok(item) => Some(item),
        Err(e) => {
          warn!(id, "Skipping unreadable queue item: {}", e);
          None
        }
      })
      .collect();
    Ok(items)
  }

  pub fn get(&self, id: i64) -> Result<Option<QueueItem>> {
    let row = self
      .conn()?
      .query_row(
        "SELECT item_type, data, enqueued_at FROM offline_queue WHERE id = ?",
        params![id],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue item {}: {}", id, e))?;

    row
      .map(|(item_type, data, enqueued_at)| to_item(id, item_type, &data, &enqueued_at))
      .transpose()
  }

  pub fn remove(&self, id: i64) -> Result<bool> {
    let deleted = self
      .conn()?
      .execute("DELETE FROM offline_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queue item {}: {}", id, e))?;
    Ok(deleted > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue items: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Insert a row verbatim, bypassing payload serialization.
  #[cfg(test)]
  pub(crate) fn append_raw(&self, item_type: &str, data: &str) -> Result<i64> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT INTO offline_queue (item_type, data, enqueued_at) VALUES (?, ?, ?)",
      params![item_type, data, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
  }
}

fn to_item(id: i64, item_type: String, data: &str, enqueued_at: &str) -> Result<QueueItem> {
  let data: Value =
    serde_json::from_str(data).map_err(|e| eyre!("Failed to parse payload of item {}: {}", id, e))?;
  let enqueued_at = DateTime::parse_from_rfc3339(enqueued_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", enqueued_at, e))?;

  Ok(QueueItem {
    id,
    item_type,
    data,
    enqueued_at,
  })
}
