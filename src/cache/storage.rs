//! Persistent key/value store trait and its SQLite and in-memory implementations.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Byte-oriented key/value store backing the cache and the operation queue.
///
/// `set` must not return before the value is durable; the queue relies on
/// this for at-least-once delivery.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<()>;

  /// All keys starting with `prefix`, sorted.
  fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

  /// Write several entries, in order. Implementations that can should apply
  /// them all or none.
  fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
    for (key, value) in entries {
      self.set(key, value)?;
    }
    Ok(())
  }

  fn remove_many(&self, keys: &[String]) -> Result<()> {
    for key in keys {
      self.remove(key)?;
    }
    Ok(())
  }
}

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self
      .entries
      .lock()
      .map_err(|e| Error::storage(format!("Lock poisoned: {}", e)))
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.entries()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    self.entries()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.entries()?.remove(key);
    Ok(())
  }

  fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
    let mut map = self.entries()?;
    for (key, value) in entries {
      map.insert(key.clone(), value.clone());
    }
    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(
      self
        .entries()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}

/// SQLite-based key/value store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| Error::storage(format!("Failed to create store directory: {}", e)))?;
      }
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::storage(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// A store that is discarded when dropped.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::storage("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| Error::storage(format!("Failed to run store migrations: {}", e)))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::storage(format!("Lock poisoned: {}", e)))
  }
}

const STORE_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.conn()?;
    conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| Error::storage(format!("Failed to read {}: {}", key, e)))
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| Error::storage(format!("Failed to write {}: {}", key, e)))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| Error::storage(format!("Failed to remove {}: {}", key, e)))?;
    Ok(())
  }

  fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;

    // substr instead of LIKE: '_' in our prefixes would be a wildcard
    let mut stmt = conn
      .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(|e| Error::storage(format!("Failed to prepare key listing: {}", e)))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get::<_, String>(0))
      .map_err(|e| Error::storage(format!("Failed to list keys: {}", e)))?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(keys)
  }

  fn set_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

    for (key, value) in entries {
      tx.execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| Error::storage(format!("Failed to write {}: {}", key, e)))?;
    }

    tx.commit()
      .map_err(|e| Error::storage(format!("Failed to commit transaction: {}", e)))
  }

  fn remove_many(&self, keys: &[String]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

    for key in keys {
      tx.execute("DELETE FROM kv WHERE key = ?", params![key])
        .map_err(|e| Error::storage(format!("Failed to remove {}: {}", key, e)))?;
    }

    tx.commit()
      .map_err(|e| Error::storage(format!("Failed to commit transaction: {}", e)))
  }
}
