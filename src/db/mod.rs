//! SQLite connection helpers shared by the response cache and the write queue.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open or create the database at `path` and apply `schema`.
pub fn open(path: &Path, schema: &str) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  prepare(conn, schema)
}

/// Open a private in-memory database with `schema` applied.
pub fn open_in_memory(schema: &str) -> Result<Connection> {
  let conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

  prepare(conn, schema)
}

/// Default location for a database file of this application.
pub fn default_path(file_name: &str) -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offline-cache").join(file_name))
}

fn prepare(conn: Connection, schema: &str) -> Result<Connection> {
  conn
    .busy_timeout(BUSY_TIMEOUT)
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

  conn
    .execute_batch(schema)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

  Ok(conn)
}
