use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use super::record::{CacheSettings, RecordCache};
use super::traits::Cacheable;
use crate::clock::Clock;
use crate::event::EventSender;
use crate::remote::RemoteClient;
use crate::store::KeyValueStore;

/// Type-erased view of a [`RecordCache`], used by code that only knows a
/// resource name (the write queue, logout teardown).
#[async_trait]
pub trait CacheHandle: Send + Sync {
  fn resource(&self) -> &str;

  /// Seed from a raw server response body.
  async fn seed_json(&self, value: Value) -> Result<(), serde_json::Error>;

  fn invalidate(&self);

  async fn clear(&self);
}

#[async_trait]
impl<T: Cacheable> CacheHandle for RecordCache<T> {
  fn resource(&self) -> &str {
    RecordCache::resource(self)
  }

  async fn seed_json(&self, value: Value) -> Result<(), serde_json::Error> {
    let value: T = serde_json::from_value(value)?;
    self.seed(value).await;
    Ok(())
  }

  fn invalidate(&self) {
    RecordCache::invalidate(self)
  }

  async fn clear(&self) {
    RecordCache::clear(self).await
  }
}

struct Entry {
  handle: Arc<dyn CacheHandle>,
  typed: Arc<dyn Any + Send + Sync>,
}

/// Builds record caches over shared dependencies and remembers them by
/// resource name.
#[derive(Clone)]
pub struct CacheRegistry {
  remote: Arc<dyn RemoteClient>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  settings: CacheSettings,
  events: Option<EventSender>,
  entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl CacheRegistry {
  pub fn new(
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
  ) -> Self {
    Self {
      remote,
      store,
      clock,
      settings,
      events: None,
      entries: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Caches created from now on report rejected sessions on `events`.
  pub fn with_events(mut self, events: EventSender) -> Self {
    self.events = Some(events);
    self
  }

  /// Cache for `resource`, created on first use and refreshed from `path`.
  pub fn record<T: Cacheable>(&self, resource: &str, path: &str) -> RecordCache<T> {
    let mut entries = self.entries();

    if let Some(entry) = entries.get(resource) {
      if let Some(cache) = entry.typed.downcast_ref::<RecordCache<T>>() {
        return cache.clone();
      }
      warn!(resource, "replacing cache registered with a different record type");
    }

    let cache = RecordCache::new(
      resource,
      path,
      Arc::clone(&self.remote),
      Arc::clone(&self.store),
      Arc::clone(&self.clock),
      self.settings,
    );
    let cache = match &self.events {
      Some(events) => cache.with_events(events.clone()),
      None => cache,
    };
    entries.insert(
      resource.to_string(),
      Entry {
        handle: Arc::new(cache.clone()),
        typed: Arc::new(cache.clone()),
      },
    );
    cache
  }

  pub fn handle(&self, resource: &str) -> Option<Arc<dyn CacheHandle>> {
    self
      .entries()
      .get(resource)
      .map(|entry| Arc::clone(&entry.handle))
  }

  /// Clear every registered cache and forget them (logout).
  ///
  /// Caches still held by callers stay usable but are no longer reachable
  /// through the registry.
  pub async fn clear_all(&self) {
    let handles: Vec<Arc<dyn CacheHandle>> = std::mem::take(&mut *self.entries())
      .into_values()
      .map(|entry| entry.handle)
      .collect();

    for handle in handles {
      handle.clear().await;
    }
  }

  fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
