//! Key-value storage backends.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// A single operation in a batch write.
#[derive(Debug, Clone)]
pub enum BatchOp {
  Put { key: String, value: Vec<u8> },
  Delete { key: String },
}

/// Trait for flat key-value storage backends.
///
/// `get` distinguishes a missing key (`Ok(None)`) from a storage failure
/// (`Err`). The sync engine relies on the missing-key signal for its
/// idempotency probes, so backends must never report a miss as an error.
pub trait KvBackend: Send + Sync {
  /// Read a value. `Ok(None)` means the key is absent.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Write a value, replacing any existing entry.
  fn put(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Remove a key. Removing an absent key is not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// Apply several operations in one write.
  fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;

  /// Remove every key starting with `prefix`.
  fn delete_prefix(&self, prefix: &str) -> Result<()>;

  /// List all keys starting with `prefix`, in lexicographic order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// SQLite-based backend: a single `kv` table behind a mutex-guarded
/// connection.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
"#;

impl SqliteBackend {
  /// Open or create the cache database at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KvBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT value FROM kv WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let mut rows = stmt
      .query_map(params![key], |row| row.get::<_, Vec<u8>>(0))
      .map_err(|e| eyre!("Failed to query key {}: {}", key, e))?;

    match rows.next() {
      Some(row) => Ok(Some(
        row.map_err(|e| eyre!("Failed to read key {}: {}", key, e))?,
      )),
      None => Ok(None),
    }
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store key {}: {}", key, e))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete key {}: {}", key, e))?;

    Ok(())
  }

  fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for op in ops {
      let result = match &op {
        BatchOp::Put { key, value } => conn.execute(
          "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
          params![key, value],
        ),
        BatchOp::Delete { key } => conn.execute("DELETE FROM kv WHERE key = ?", params![key]),
      };

      if let Err(e) = result {
        let _ = conn.execute("ROLLBACK", []);
        return Err(eyre!("Failed to apply batch operation: {}", e));
      }
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete_prefix(&self, prefix: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
        params![prefix],
      )
      .map_err(|e| eyre!("Failed to delete prefix {}: {}", prefix, e))?;

    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to query prefix {}: {}", prefix, e))?
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| eyre!("Failed to read keys: {}", e))?;

    Ok(keys)
  }
}

/// In-memory backend used by the test suite.
#[cfg(test)]
pub struct MemoryBackend {
  map: Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
}

#[cfg(test)]
impl MemoryBackend {
  pub fn new() -> Self {
    Self {
      map: Mutex::new(std::collections::BTreeMap::new()),
    }
  }
}

#[cfg(test)]
impl KvBackend for MemoryBackend {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let map = self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(map.get(key).cloned())
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<()> {
    let mut map = self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    map.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let mut map = self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    map.remove(key);
    Ok(())
  }

  fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
    let mut map = self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    for op in ops {
      match op {
        BatchOp::Put { key, value } => {
          map.insert(key, value);
        }
        BatchOp::Delete { key } => {
          map.remove(&key);
        }
      }
    }
    Ok(())
  }

  fn delete_prefix(&self, prefix: &str) -> Result<()> {
    let mut map = self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    map.retain(|key, _| !key.starts_with(prefix));
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let map = self.map.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      map
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, _)| key.clone())
        .collect(),
    )
  }
}
