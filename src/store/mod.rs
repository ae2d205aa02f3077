//! Durable string-keyed storage used by the cache and the write queue.
//!
//! Each component owns a disjoint key namespace (see [`keys`]), so writes
//! from different components never need to be serialized against each other.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use color_eyre::Result;

/// Async key-value storage backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<String>>;

  async fn set(&self, key: &str, value: &str) -> Result<()>;

  async fn remove(&self, key: &str) -> Result<()>;

  /// Values for `keys`, in the same order. Missing keys yield `None`.
  async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
      values.push(self.get(key).await?);
    }
    Ok(values)
  }

  async fn multi_set(&self, entries: &[(String, String)]) -> Result<()> {
    for (key, value) in entries {
      self.set(key, value).await?;
    }
    Ok(())
  }

  async fn multi_remove(&self, keys: &[String]) -> Result<()> {
    for key in keys {
      self.remove(key).await?;
    }
    Ok(())
  }
}

/// Key namespaces.
pub mod keys {
  /// Ordered list of queued write ids.
  pub const WRITE_INDEX: &str = "writequeue:index";

  pub fn cache(resource: &str) -> String {
    format!("cache:{}", resource)
  }

  pub fn write(id: &str) -> String {
    format!("writequeue:{}", id)
  }
}
