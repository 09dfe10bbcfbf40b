//! Persistent store implementations.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::traits::PersistentStore;

/// Store that doesn't keep anything.
/// Used when persistence is disabled - every read misses.
pub struct NoopStorage;

#[async_trait]
impl PersistentStore for NoopStorage {
  async fn get(&self, _key: &str) -> Result<Option<Value>> {
    Ok(None) // Always miss
  }

  async fn set(&self, _key: &str, _value: Value) -> Result<()> {
    Ok(()) // Discard
  }

  async fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based key-value store.
///
/// Queries run on the blocking pool so callers on the async runtime never
/// stall on disk I/O.
#[derive(Clone)]
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("satchel").join("store.db"))
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&Connection) -> Result<R> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Store task failed: {}", e))?
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[async_trait]
impl PersistentStore for SqliteStorage {
  async fn get(&self, key: &str) -> Result<Option<Value>> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        let data: Option<Vec<u8>> = conn
          .query_row(
            "SELECT data FROM kv_store WHERE key = ?",
            params![key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

        data
          .map(|data| {
            serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize {}: {}", key, e))
          })
          .transpose()
      })
      .await
  }

  async fn set(&self, key: &str, value: Value) -> Result<()> {
    let key = key.to_string();
    let data = serde_json::to_vec(&value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO kv_store (key, data, updated_at)
             VALUES (?, ?, datetime('now'))",
            params![key, data],
          )
          .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
        Ok(())
      })
      .await
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM kv_store WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
        Ok(())
      })
      .await
  }
}
