//! Durable queue of mutating operations made while offline, replayed later.
//!
//! Items are replayed one at a time in enqueue order. An item leaves the
//! queue only after its remote call succeeded; failed items stay for the
//! next drain and do not block the ones behind them.

mod storage;

pub use storage::SqliteQueue;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::net::RemoteApi;

/// The deferred operations the backend knows how to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemType {
  DiaryCreate,
  DiaryUpdate,
  DiaryDelete,
  SettingsUpdate,
}

impl QueueItemType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::DiaryCreate => "diary_create",
      Self::DiaryUpdate => "diary_update",
      Self::DiaryDelete => "diary_delete",
      Self::SettingsUpdate => "settings_update",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "diary_create" => Some(Self::DiaryCreate),
      "diary_update" => Some(Self::DiaryUpdate),
      "diary_delete" => Some(Self::DiaryDelete),
      "settings_update" => Some(Self::SettingsUpdate),
      _ => None,
    }
  }
}

/// A persisted pending write.
///
/// `item_type` stays a string so rows written by other versions with types
/// this build does not know survive in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
  pub id: i64,
  pub item_type: String,
  pub data: Value,
  pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
  pub fn kind(&self) -> Option<QueueItemType> {
    QueueItemType::parse(&self.item_type)
  }
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Unknown types, left in place
  pub skipped: usize,
}

pub struct WriteQueue {
  storage: Arc<SqliteQueue>,
  /// Serializes drains so no item is replayed twice concurrently
  drain_lock: Mutex<()>,
}

impl WriteQueue {
  pub fn new(storage: SqliteQueue) -> Self {
    Self {
      storage: Arc::new(storage),
      drain_lock: Mutex::new(()),
    }
  }

  /// Durably append a write. Returns the item id once persisted.
  pub async fn enqueue(&self, kind: QueueItemType, data: Value) -> Result<i64> {
    let id = self
      .blocking(move |storage| storage.append(kind.as_str(), &data))
      .await?;
    info!(id, item_type = kind.as_str(), "Queued offline item");
    Ok(id)
  }

  pub fn items(&self) -> Result<Vec<QueueItem>> {
    self.storage.all()
  }

  pub fn get(&self, id: i64) -> Result<Option<QueueItem>> {
    self.storage.get(id)
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.len()
  }

  pub fn is_empty(&self) -> Result<bool> {
    self.storage.is_empty()
  }

  async fn blocking<T, F>(&self, op: F) -> Result<T>
  where
    F: FnOnce(&SqliteQueue) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || op(&storage))
      .await
      .map_err(|e| eyre!("Queue task failed: {}", e))?
  }

  /// Replay every item present when the drain starts, in order.
  ///
  /// Never fails: errors reading the queue end the pass early and are
  /// logged, per-item failures are logged and the item is kept. Rows that
  /// cannot be decoded are skipped and kept like unknown types.
  pub async fn drain<R: RemoteApi + ?Sized>(&self, remote: &R) -> DrainReport {
    let _guard = self.drain_lock.lock().await;
    let mut report = DrainReport::default();

    let rows = match self.blocking(|storage| storage.scan()).await {
      Ok(rows) => rows,
      Err(e) => {
        error!("Background sync failed: {}", e);
        return report;
      }
    };

    info!(pending = rows.len(), "Performing background sync");

    for (id, row) in rows {
      let item = match row {
        Ok(item) => item,
        Err(e) => {
          warn!(id, "Unreadable item, leaving in queue: {}", e);
          report.skipped += 1;
          continue;
        }
      };
      let Some(kind) = item.kind() else {
        warn!(id, item_type = %item.item_type, "Unknown item type, leaving in queue");
        report.skipped += 1;
        continue;
      };

      report.attempted += 1;
      match replay(remote, kind, &item.data).await {
        Ok(()) => {
          report.succeeded += 1;
          match self.blocking(move |storage| storage.remove(id)).await {
            Ok(_) => info!(id, item_type = kind.as_str(), "Replayed offline item"),
            // Still queued, so it will be sent again on the next drain
            Err(e) => error!(id, "Replayed item could not be removed: {}", e),
          }
        }
        Err(e) => {
          report.failed += 1;
          error!(id, item_type = kind.as_str(), "Failed to process offline item: {}", e);
        }
      }
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      skipped = report.skipped,
      "Background sync completed"
    );
    report
  }
}

async fn replay<R: RemoteApi + ?Sized>(remote: &R, kind: QueueItemType, data: &Value) -> Result<()> {
  match kind {
    QueueItemType::DiaryCreate => remote.create_diary(data).await,
    QueueItemType::DiaryUpdate => remote.update_diary(data).await,
    QueueItemType::DiaryDelete => remote.delete_diary(data).await,
    QueueItemType::SettingsUpdate => remote.update_settings(data).await,
  }
}
