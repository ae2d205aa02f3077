use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::KeyValueStore;

/// Store that keeps everything in process memory.
///
/// Nothing survives a restart; useful for tests and signed-out sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.entries().get(key).cloned())
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    self.entries().insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    self.entries().remove(key);
    Ok(())
  }

  async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
    let entries = self.entries();
    Ok(keys.iter().map(|k| entries.get(k).cloned()).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_set_get_remove() {
    let store = MemoryStore::new();
    store.set("cache:profile", "{}").await.unwrap();

    assert_eq!(store.get("cache:profile").await.unwrap().as_deref(), Some("{}"));

    store.remove("cache:profile").await.unwrap();
    assert!(store.get("cache:profile").await.unwrap().is_none());
    assert!(store.is_empty());
  }

  #[tokio::test]
  async fn test_multi_get_preserves_order() {
    let store = MemoryStore::new();
    store
      .multi_set(&[
        ("a".to_string(), "1".to_string()),
        ("c".to_string(), "3".to_string()),
      ])
      .await
      .unwrap();

    let values = store
      .multi_get(&["c".to_string(), "b".to_string(), "a".to_string()])
      .await
      .unwrap();
    assert_eq!(values, vec![Some("3".to_string()), None, Some("1".to_string())]);
  }
}
