//! Durable queue of writes the server has not confirmed yet.
//!
//! Writes survive restarts (each one is stored under `writequeue:<id>`, their
//! order under `writequeue:index`) and are delivered oldest first. A write is
//! only removed once the server confirms it or rejects it for good, so a
//! retry never skips ahead of an earlier write to the same resource.

mod write;

pub use write::{FlushReport, QueuedWrite, WriteMethod, WriteStatus};

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::CacheRegistry;
use crate::config::Config;
use crate::event::{Event, EventSender};
use crate::remote::{RemoteClient, RemoteError, RemoteResponse, RequestOptions};
use crate::store::{keys, KeyValueStore};

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
  /// Sends allowed per write; reaching it turns a retryable error terminal
  pub max_attempts: u32,
  pub timeout: Duration,
}

impl QueueSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      max_attempts: config.queue.max_attempts,
      timeout: config.request_timeout(),
    }
  }
}

impl Default for QueueSettings {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      timeout: Duration::from_secs(15),
    }
  }
}

#[derive(Default)]
struct QueueState {
  pending: Vec<QueuedWrite>,
  /// Ids currently being sent by some flush
  in_flight: HashSet<String>,
  /// Terminal failures not yet acknowledged by the user
  failed: Vec<QueuedWrite>,
}

/// What happened to a write once its send returned.
enum Settled {
  Delivered(QueuedWrite),
  Retry(QueuedWrite),
  Failed(QueuedWrite),
  /// Drained while in flight
  Gone,
}

struct QueueInner {
  remote: Arc<dyn RemoteClient>,
  store: Arc<dyn KeyValueStore>,
  caches: CacheRegistry,
  events: EventSender,
  settings: QueueSettings,
  state: Mutex<QueueState>,
  /// Serializes index rewrites so an older snapshot never lands last
  index_lock: tokio::sync::Mutex<()>,
}

/// Persistent FIFO of pending mutations.
#[derive(Clone)]
pub struct WriteQueue {
  inner: Arc<QueueInner>,
}

impl WriteQueue {
  pub fn new(
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn KeyValueStore>,
    caches: CacheRegistry,
    events: EventSender,
    settings: QueueSettings,
  ) -> Self {
    Self {
      inner: Arc::new(QueueInner {
        remote,
        store,
        caches,
        events,
        settings,
        state: Mutex::new(QueueState::default()),
        index_lock: tokio::sync::Mutex::new(()),
      }),
    }
  }

  /// Store `write` durably, then try to deliver everything queued.
  ///
  /// Enqueuing an id that is already pending is a no-op.
  pub async fn enqueue(&self, write: QueuedWrite) -> WriteStatus {
    let id = write.id.clone();
    if self.inner.lock().pending.iter().any(|w| w.id == id) {
      debug!(write_id = %id, "write already queued");
      return self.status(&id);
    }

    // stored before it becomes visible to flush, so delivery can't be undone by this write
    self.inner.persist(&write).await;
    self.inner.lock().pending.push(write.clone());
    self.inner.persist_index().await;

    info!(write_id = %id, resource = %write.resource, method = ?write.method, "write queued");
    let _ = self.inner.events.send(Event::WriteQueued {
      id: id.clone(),
      resource: write.resource,
    });

    self.flush().await;
    self.status(&id)
  }

  /// Deliver pending writes in order.
  ///
  /// A retryable failure ends the pass and leaves the write at the head of
  /// the queue. Writes another flush is already sending are skipped along
  /// with any later write to the same resource.
  pub async fn flush(&self) -> FlushReport {
    let mut report = FlushReport::default();
    let mut attempted = HashSet::new();

    loop {
      let progressed = self.flush_pass(&mut report, &mut attempted).await;
      if report.stalled_on.is_some() || !progressed {
        break;
      }
      // writes enqueued while this pass ran would otherwise wait for the next trigger
      let more = {
        let state = self.inner.lock();
        state
          .pending
          .iter()
          .any(|w| !attempted.contains(&w.id) && !state.in_flight.contains(&w.id))
      };
      if !more {
        break;
      }
    }

    report.remaining = self.inner.lock().pending.len();
    report
  }

  async fn flush_pass(&self, report: &mut FlushReport, attempted: &mut HashSet<String>) -> bool {
    let order: Vec<String> = self
      .inner
      .lock()
      .pending
      .iter()
      .map(|w| w.id.clone())
      .collect();
    let mut blocked: HashSet<String> = HashSet::new();
    let mut progressed = false;

    for id in order {
      if attempted.contains(&id) {
        continue;
      }
      let write = {
        let mut state = self.inner.lock();
        let Some(write) = state.pending.iter().find(|w| w.id == id).cloned() else {
          continue;
        };
        if blocked.contains(&write.resource) {
          continue;
        }
        if state.in_flight.contains(&id) {
          blocked.insert(write.resource);
          continue;
        }
        state.in_flight.insert(id.clone());
        write
      };
      attempted.insert(id.clone());

      debug!(
        write_id = %id,
        resource = %write.resource,
        attempt = write.attempts + 1,
        "sending queued write"
      );
      let options = RequestOptions {
        timeout: self.inner.settings.timeout,
      };
      let result = self
        .inner
        .remote
        .request(write.method.http_method(), &write.path, write.body(), options)
        .await;

      let data = match &result {
        Ok(RemoteResponse { data, .. }) => data.clone(),
        Err(_) => None,
      };
      match self.inner.settle(&id, &result) {
        Settled::Delivered(write) => {
          self.inner.delivered(&write, data).await;
          report.delivered.push(write.id);
          progressed = true;
        }
        Settled::Failed(write) => {
          self.inner.failed(&write).await;
          report.failed.push(write.id);
          progressed = true;
        }
        Settled::Retry(write) => {
          self.inner.persist(&write).await;
          warn!(
            write_id = %write.id,
            resource = %write.resource,
            attempts = write.attempts,
            error = ?write.last_error,
            "write not delivered, will retry"
          );
          report.stalled_on = write.last_error;
          return progressed;
        }
        Settled::Gone => {
          debug!(write_id = %id, "write drained while in flight");
        }
      }
    }

    progressed
  }

  /// Where `id` stands right now.
  pub fn status(&self, id: &str) -> WriteStatus {
    let state = self.inner.lock();
    if state.pending.iter().any(|w| w.id == id) {
      WriteStatus::Pending
    } else if state.failed.iter().any(|w| w.id == id) {
      WriteStatus::Failed
    } else {
      WriteStatus::Delivered
    }
  }

  /// Writes waiting for delivery, oldest first.
  pub fn pending(&self) -> Vec<QueuedWrite> {
    self.inner.lock().pending.clone()
  }

  /// Terminal failures the user has not acknowledged yet.
  pub fn failures(&self) -> Vec<QueuedWrite> {
    self.inner.lock().failed.clone()
  }

  pub fn is_in_flight(&self, id: &str) -> bool {
    self.inner.lock().in_flight.contains(id)
  }

  /// Dismiss a reported failure.
  pub fn acknowledge(&self, id: &str) -> Option<QueuedWrite> {
    let mut state = self.inner.lock();
    let pos = state.failed.iter().position(|w| w.id == id)?;
    Some(state.failed.remove(pos))
  }

  /// Drop a pending write at the user's request. Writes being sent can't be
  /// discarded.
  pub async fn discard(&self, id: &str) -> Option<QueuedWrite> {
    let removed = {
      let mut state = self.inner.lock();
      if state.in_flight.contains(id) {
        warn!(write_id = id, "cannot discard a write that is being sent");
        return None;
      }
      let pos = state.pending.iter().position(|w| w.id == id)?;
      state.pending.remove(pos)
    };

    self.inner.forget(id).await;
    info!(write_id = id, resource = %removed.resource, "pending write discarded");
    Some(removed)
  }

  /// Reload writes persisted by an earlier session, ahead of anything queued
  /// since. Returns how many were restored.
  pub async fn restore(&self) -> Result<usize> {
    let Some(raw) = self.inner.store.get(keys::WRITE_INDEX).await? else {
      return Ok(0);
    };
    let ids: Vec<String> = serde_json::from_str(&raw)
      .map_err(|e| eyre!("Failed to parse write queue index: {}", e))?;

    let write_keys: Vec<String> = ids.iter().map(|id| keys::write(id)).collect();
    let values = self.inner.store.multi_get(&write_keys).await?;

    let mut restored = Vec::with_capacity(ids.len());
    for (id, value) in ids.iter().zip(values) {
      match value.map(|raw| serde_json::from_str::<QueuedWrite>(&raw)) {
        Some(Ok(write)) => restored.push(write),
        Some(Err(e)) => warn!(write_id = %id, error = %e, "dropping unreadable queued write"),
        None => warn!(write_id = %id, "queued write missing from store"),
      }
    }

    let count = {
      let mut state = self.inner.lock();
      let known: HashSet<String> = state.pending.iter().map(|w| w.id.clone()).collect();
      let fresh: Vec<QueuedWrite> = restored
        .into_iter()
        .filter(|w| !known.contains(&w.id))
        .collect();
      let count = fresh.len();
      state.pending.splice(0..0, fresh);
      count
    };

    self.inner.persist_index().await;
    info!(count, "restored queued writes");
    Ok(count)
  }

  /// Empty the queue and its storage, returning what was still pending.
  pub async fn drain(&self) -> Vec<QueuedWrite> {
    let drained = {
      let mut state = self.inner.lock();
      state.failed.clear();
      std::mem::take(&mut state.pending)
    };

    let write_keys: Vec<String> = drained.iter().map(|w| keys::write(&w.id)).collect();
    if let Err(e) = self.inner.store.multi_remove(&write_keys).await {
      warn!(error = %e, "failed to remove drained writes");
    }
    let _guard = self.inner.index_lock.lock().await;
    if let Err(e) = self.inner.store.remove(keys::WRITE_INDEX).await {
      warn!(error = %e, "failed to remove write queue index");
    }

    if !drained.is_empty() {
      info!(count = drained.len(), "drained pending writes");
    }
    drained
  }
}

impl QueueInner {
  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn settle(&self, id: &str, result: &Result<RemoteResponse, RemoteError>) -> Settled {
    let mut state = self.lock();
    state.in_flight.remove(id);
    let Some(pos) = state.pending.iter().position(|w| w.id == id) else {
      return Settled::Gone;
    };

    let error = match result {
      Ok(_) => return Settled::Delivered(state.pending.remove(pos)),
      Err(error) => error,
    };

    let retry = {
      let write = &mut state.pending[pos];
      write.attempts += 1;
      write.last_error = Some(error.clone());
      error.is_retryable() && write.attempts < self.settings.max_attempts
    };

    if retry {
      Settled::Retry(state.pending[pos].clone())
    } else {
      let write = state.pending.remove(pos);
      state.failed.push(write.clone());
      Settled::Failed(write)
    }
  }

  async fn delivered(&self, write: &QueuedWrite, data: Option<Value>) {
    self.forget(&write.id).await;
    info!(write_id = %write.id, resource = %write.resource, "write delivered");

    if let Some(cache) = self.caches.handle(&write.resource) {
      match (write.method, data) {
        (WriteMethod::Delete, _) => cache.clear().await,
        (_, Some(value)) => {
          if let Err(e) = cache.seed_json(value).await {
            warn!(resource = %write.resource, error = %e, "response does not match cached record");
            cache.invalidate();
          }
        }
        (_, None) => cache.invalidate(),
      }
    }

    let _ = self.events.send(Event::WriteDelivered {
      id: write.id.clone(),
      resource: write.resource.clone(),
    });
  }

  async fn failed(&self, write: &QueuedWrite) {
    self.forget(&write.id).await;
    warn!(
      write_id = %write.id,
      resource = %write.resource,
      attempts = write.attempts,
      error = ?write.last_error,
      "write failed permanently"
    );

    // the optimistic local value no longer matches the server
    if let Some(cache) = self.caches.handle(&write.resource) {
      cache.invalidate();
    }

    if write.last_error == Some(RemoteError::Unauthorized) {
      let _ = self.events.send(Event::SessionExpired);
    }
    let _ = self.events.send(Event::WriteFailed(write.clone()));
  }

  async fn persist(&self, write: &QueuedWrite) {
    let raw = match serde_json::to_string(write) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(write_id = %write.id, error = %e, "failed to serialize queued write");
        return;
      }
    };
    if let Err(e) = self.store.set(&keys::write(&write.id), &raw).await {
      warn!(write_id = %write.id, error = %e, "failed to persist queued write");
    }
  }

  async fn forget(&self, id: &str) {
    if let Err(e) = self.store.remove(&keys::write(id)).await {
      warn!(write_id = id, error = %e, "failed to remove queued write");
    }
    self.persist_index().await;
  }

  async fn persist_index(&self) {
    let _guard = self.index_lock.lock().await;
    let ids: Vec<String> = self.lock().pending.iter().map(|w| w.id.clone()).collect();
    match serde_json::to_string(&ids) {
      Ok(raw) => {
        if let Err(e) = self.store.set(keys::WRITE_INDEX, &raw).await {
          warn!(error = %e, "failed to persist write queue index");
        }
      }
      Err(e) => warn!(error = %e, "failed to serialize write queue index"),
    }
  }
}
