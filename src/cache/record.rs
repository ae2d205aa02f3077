//! Single-resource cache with TTL refresh, offline fallback and fetch coalescing.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::traits::{CacheError, CacheResult, CacheState, Cacheable};
use crate::clock::Clock;
use crate::config::Config;
use crate::event::{Event, EventSender};
use crate::remote::{Method, RemoteClient, RemoteError, RequestOptions};
use crate::store::{keys, KeyValueStore};

type FetchResult<T> = Result<(T, DateTime<Utc>), RemoteError>;
type SharedFetch<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

/// Last known-good value and when the server confirmed it.
///
/// This is also the persisted form under `cache:<resource>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRecord<T> {
  pub value: T,
  pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
  /// How long before a fetched value is considered stale
  pub ttl: Duration,
  /// Timeout for the refresh request
  pub timeout: std::time::Duration,
}

impl CacheSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      ttl: config.cache_ttl(),
      timeout: config.request_timeout(),
    }
  }
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      ttl: Duration::minutes(5),
      timeout: std::time::Duration::from_secs(15),
    }
  }
}

struct RecordState<T> {
  record: Option<CachedRecord<T>>,
  invalidated: bool,
  /// Set once the persisted copy has been looked up
  hydrated: bool,
  /// Bumped by seed/clear so a fetch started earlier cannot overwrite them
  generation: u64,
  in_flight: Option<SharedFetch<T>>,
}

impl<T> RecordState<T> {
  fn classify(&self, now: DateTime<Utc>, ttl: Duration) -> CacheState {
    match &self.record {
      None => CacheState::Unavailable,
      Some(_) if self.invalidated => CacheState::Stale,
      Some(record) if now - record.fetched_at < ttl => CacheState::Fresh,
      Some(_) => CacheState::Stale,
    }
  }
}

struct CacheInner<T> {
  resource: String,
  path: String,
  settings: CacheSettings,
  remote: Arc<dyn RemoteClient>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  events: Option<EventSender>,
  state: Mutex<RecordState<T>>,
}

/// Cache for one logical resource, e.g. the current user's profile.
///
/// Reads are served from memory while fresh. Once stale, the next `get()`
/// refreshes from the server; if that fails the last value is still returned,
/// flagged as offline. Concurrent readers share a single in-flight request.
pub struct RecordCache<T> {
  inner: Arc<CacheInner<T>>,
}

impl<T: Cacheable> RecordCache<T> {
  /// Create a cache for `resource`, refreshed with a GET on `path`.
  pub fn new(
    resource: impl Into<String>,
    path: impl Into<String>,
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
  ) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        resource: resource.into(),
        path: path.into(),
        settings,
        remote,
        store,
        clock,
        events: None,
        state: Mutex::new(RecordState {
          record: None,
          invalidated: false,
          hydrated: false,
          generation: 0,
          in_flight: None,
        }),
      }),
    }
  }

  /// Report rejected sessions on `events`. Only takes effect before the
  /// cache is first cloned.
  pub fn with_events(mut self, events: EventSender) -> Self {
    match Arc::get_mut(&mut self.inner) {
      Some(inner) => inner.events = Some(events),
      None => warn!(resource = %self.inner.resource, "cache already shared, events not attached"),
    }
    self
  }

  pub fn resource(&self) -> &str {
    &self.inner.resource
  }

  /// Current freshness, without any I/O.
  pub fn state(&self) -> CacheState {
    let now = self.inner.clock.now();
    self.inner.lock().classify(now, self.inner.settings.ttl)
  }

  /// In-memory record, without any I/O.
  pub fn peek(&self) -> Option<CachedRecord<T>> {
    self.inner.lock().record.clone()
  }

  /// Read the resource.
  ///
  /// 1. Fresh and not forced: return the in-memory value
  /// 2. Otherwise refresh from the network (joining a fetch already in flight)
  /// 3. On failure return the last value as offline, or fail if there is none
  pub async fn get(&self, force_refresh: bool) -> Result<CacheResult<T>, CacheError> {
    self.inner.hydrate().await;

    let fetch = {
      let mut state = self.inner.lock();
      let current = state.classify(self.inner.clock.now(), self.inner.settings.ttl);

      if !force_refresh && current == CacheState::Fresh {
        if let Some(record) = &state.record {
          return Ok(CacheResult::from_cache(
            record.value.clone(),
            record.fetched_at,
          ));
        }
      }

      let existing = state.in_flight.clone();
      match existing {
        Some(fetch) => {
          debug!(resource = %self.inner.resource, "joining in-flight refresh");
          fetch
        }
        None => {
          debug!(resource = %self.inner.resource, ?current, force_refresh, "refreshing");
          let fetch = CacheInner::start_fetch(&self.inner, state.generation);
          state.in_flight = Some(fetch.clone());
          fetch
        }
      }
    };

    match fetch.await {
      Ok((data, fetched_at)) => Ok(CacheResult::from_network(data, fetched_at)),
      Err(error) => {
        let fallback = self.inner.lock().record.clone();
        match fallback {
          Some(record) => {
            warn!(resource = %self.inner.resource, %error, "refresh failed, serving stale value");
            Ok(CacheResult::offline(record.value, record.fetched_at, error))
          }
          None => Err(CacheError::Unavailable {
            resource: self.inner.resource.clone(),
            source: error,
          }),
        }
      }
    }
  }

  /// Make the next `get()` refresh regardless of the TTL.
  pub fn invalidate(&self) {
    self.inner.lock().invalidated = true;
  }

  /// Store a server-confirmed value without a round trip.
  pub async fn seed(&self, value: T) {
    let record = CachedRecord {
      value,
      fetched_at: self.inner.clock.now(),
    };
    {
      let mut state = self.inner.lock();
      state.generation += 1;
      state.in_flight = None;
      state.record = Some(record.clone());
      state.invalidated = false;
      state.hydrated = true;
    }
    debug!(resource = %self.inner.resource, "seeded");
    self.inner.persist(&record).await;
  }

  /// Forget the value in memory and in storage.
  pub async fn clear(&self) {
    {
      let mut state = self.inner.lock();
      state.generation += 1;
      state.in_flight = None;
      state.record = None;
      state.invalidated = false;
      state.hydrated = true;
    }
    let key = keys::cache(&self.inner.resource);
    if let Err(e) = self.inner.store.remove(&key).await {
      warn!(resource = %self.inner.resource, error = %e, "failed to remove cached record");
    }
  }
}

impl<T: Cacheable> CacheInner<T> {
  fn lock(&self) -> MutexGuard<'_, RecordState<T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn start_fetch(inner: &Arc<Self>, generation: u64) -> SharedFetch<T> {
    let inner = Arc::clone(inner);
    async move {
      let result = inner.fetch_remote().await;
      inner.complete(generation, result).await
    }
    .boxed()
    .shared()
  }

  async fn fetch_remote(&self) -> Result<T, RemoteError> {
    let options = RequestOptions {
      timeout: self.settings.timeout,
    };
    let response = self
      .remote
      .request(Method::Get, &self.path, None, options)
      .await?;

    let data = response
      .data
      .ok_or_else(|| RemoteError::Decode(format!("empty response for {}", self.resource)))?;
    serde_json::from_value(data).map_err(|e| RemoteError::Decode(e.to_string()))
  }

  /// Apply a finished fetch. Runs once, inside the shared future.
  async fn complete(&self, generation: u64, result: Result<T, RemoteError>) -> FetchResult<T> {
    let value = match result {
      Ok(value) => value,
      Err(error) => {
        {
          let mut state = self.lock();
          if state.generation == generation {
            state.in_flight = None;
          }
        }
        if error == RemoteError::Unauthorized {
          if let Some(events) = &self.events {
            let _ = events.send(Event::SessionExpired);
          }
        }
        return Err(error);
      }
    };

    let (record, applied) = {
      let mut state = self.lock();
      if state.generation == generation {
        state.in_flight = None;
        let record = CachedRecord {
          value,
          fetched_at: self.clock.now(),
        };
        state.record = Some(record.clone());
        state.invalidated = false;
        (record, true)
      } else {
        // seeded or cleared while the request was out; the local state wins
        match state.record.clone() {
          Some(record) => (record, false),
          None => return Err(RemoteError::Network("superseded by clear".to_string())),
        }
      }
    };

    if applied {
      self.persist(&record).await;
    }
    Ok((record.value, record.fetched_at))
  }

  async fn hydrate(&self) {
    let hydrated = self.lock().hydrated;
    if hydrated {
      return;
    }

    let key = keys::cache(&self.resource);
    let loaded = match self.store.get(&key).await {
      Ok(Some(raw)) => match serde_json::from_str::<CachedRecord<T>>(&raw) {
        Ok(record) => Some(record),
        Err(e) => {
          warn!(resource = %self.resource, error = %e, "discarding unreadable cached record");
          None
        }
      },
      Ok(None) => None,
      Err(e) => {
        warn!(resource = %self.resource, error = %e, "failed to read cached record");
        None
      }
    };

    let mut state = self.lock();
    if !state.hydrated {
      state.hydrated = true;
      if state.record.is_none() {
        state.record = loaded;
      }
    }
  }

  async fn persist(&self, record: &CachedRecord<T>) {
    let key = keys::cache(&self.resource);
    let raw = match serde_json::to_string(record) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(resource = %self.resource, error = %e, "failed to serialize cached record");
        return;
      }
    };
    if let Err(e) = self.store.set(&key, &raw).await {
      warn!(resource = %self.resource, error = %e, "failed to persist cached record");
    }
  }
}

impl<T> Clone for RecordCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
