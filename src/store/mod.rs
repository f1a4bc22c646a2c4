//! Namespaced key-value store over pluggable backends.
//!
//! Every cached entity lives in one flat key space; [`Store`] is a view of
//! that space whose keys are transparently prefixed. Scoping composes:
//! `store.scope("a").scope("b")` writes under `a/b/`. The prefix is always
//! carried explicitly by the adapter, so there is no capability probing on
//! the backend.

mod backend;

#[cfg(test)]
pub use backend::MemoryBackend;
pub use backend::{BatchOp, KvBackend, SqliteBackend};

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// A prefix-scoped view of a [`KvBackend`].
///
/// Values are stored as JSON. A missing key reads back as `Ok(None)`; only
/// a genuine storage failure is an `Err`.
pub struct Store<B> {
  backend: Arc<B>,
  prefix: String,
}

impl<B> Clone for Store<B> {
  fn clone(&self) -> Self {
    Self {
      backend: Arc::clone(&self.backend),
      prefix: self.prefix.clone(),
    }
  }
}

impl<B: KvBackend> Store<B> {
  /// Create a root store with an empty prefix.
  pub fn new(backend: B) -> Self {
    Self {
      backend: Arc::new(backend),
      prefix: String::new(),
    }
  }

  /// Derive a sub-view whose keys are prefixed with `prefix` + `/`.
  pub fn scope(&self, prefix: &str) -> Store<B> {
    Store {
      backend: Arc::clone(&self.backend),
      prefix: format!("{}{}/", self.prefix, prefix),
    }
  }

  fn full_key(&self, key: &str) -> String {
    format!("{}{}", self.prefix, key)
  }

  /// Read and decode a stored value. `Ok(None)` means the key is absent.
  #[allow(dead_code)] // the sync binary only writes; readers use this
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    match self.backend.get(&self.full_key(key))? {
      Some(bytes) => {
        let value = serde_json::from_slice(&bytes)
          .map_err(|e| eyre!("Failed to decode stored value {}: {}", key, e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  /// Check for key presence without decoding.
  pub fn contains(&self, key: &str) -> Result<bool> {
    Ok(self.backend.get(&self.full_key(key))?.is_some())
  }

  /// Encode and write a value, replacing any existing entry.
  pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let bytes =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to encode value {}: {}", key, e))?;
    self.backend.put(&self.full_key(key), &bytes)
  }

  /// Remove a key. Removing an absent key is not an error.
  pub fn delete(&self, key: &str) -> Result<()> {
    self.backend.delete(&self.full_key(key))
  }

  /// Write several values in one backend batch.
  pub fn batch_put<T: Serialize>(&self, entries: &[(String, T)]) -> Result<()> {
    let ops = entries
      .iter()
      .map(|(key, value)| {
        Ok(BatchOp::Put {
          key: self.full_key(key),
          value: serde_json::to_vec(value)
            .map_err(|e| eyre!("Failed to encode value {}: {}", key, e))?,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    self.backend.batch(ops)
  }

  /// Delete every key under this store's prefix.
  pub fn clear(&self) -> Result<()> {
    self.backend.delete_prefix(&self.prefix)
  }

  /// List keys under this store's prefix, with the prefix stripped.
  pub fn keys(&self) -> Result<Vec<String>> {
    Ok(
      self
        .backend
        .keys_with_prefix(&self.prefix)?
        .into_iter()
        .map(|key| key[self.prefix.len()..].to_string())
        .collect(),
    )
  }
}
