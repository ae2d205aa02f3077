//! Scripted stand-ins for the external collaborators, shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::reminders::{NotificationId, NotificationService, PendingNotification, ReminderPayload};
use crate::remote::{Method, RemoteClient, RemoteError, RemoteResponse, RequestOptions};

pub type Scripted = Result<RemoteResponse, RemoteError>;

pub fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn ok(value: Value) -> Scripted {
  Ok(RemoteResponse {
    status: 200,
    data: Some(value),
  })
}

pub fn no_content() -> Scripted {
  Ok(RemoteResponse {
    status: 204,
    data: None,
  })
}

pub fn offline() -> Scripted {
  Err(RemoteError::Network("offline".to_string()))
}

pub fn rejected(status: u16) -> Scripted {
  Err(RemoteError::Validation {
    status,
    message: "rejected".to_string(),
  })
}

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(now: DateTime<Utc>) -> Arc<Self> {
    Arc::new(Self {
      now: Mutex::new(now),
    })
  }

  pub fn advance(&self, by: Duration) {
    *self.now.lock().unwrap() += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
}

/// Remote client that replays scripted responses per path.
///
/// One-shot responses queued with `push` are consumed first; after that the
/// `always` response for the path is used, and unscripted paths fail as offline.
#[derive(Default)]
pub struct FakeRemote {
  scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
  fallback: Mutex<HashMap<String, Scripted>>,
  calls: Mutex<Vec<RecordedCall>>,
  delay: Mutex<Option<std::time::Duration>>,
  active: AtomicUsize,
  max_active: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn push(&self, path: &str, result: Scripted) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(result);
  }

  pub fn always(&self, path: &str, result: Scripted) {
    self
      .fallback
      .lock()
      .unwrap()
      .insert(path.to_string(), result);
  }

  /// Hold every request open for `delay` before answering.
  pub fn set_delay(&self, delay: std::time::Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, path: &str) -> usize {
    self.calls().iter().filter(|c| c.path == path).count()
  }

  pub fn max_concurrent(&self) -> usize {
    self.max_active.load(Ordering::SeqCst)
  }

  fn next_result(&self, path: &str) -> Scripted {
    if let Some(result) = self
      .scripts
      .lock()
      .unwrap()
      .get_mut(path)
      .and_then(VecDeque::pop_front)
    {
      return result;
    }
    self
      .fallback
      .lock()
      .unwrap()
      .get(path)
      .cloned()
      .unwrap_or_else(offline)
  }
}

#[async_trait]
impl RemoteClient for FakeRemote {
  async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
    _options: RequestOptions,
  ) -> Result<RemoteResponse, RemoteError> {
    self.calls.lock().unwrap().push(RecordedCall {
      method,
      path: path.to_string(),
      body: body.cloned(),
    });
    let result = self.next_result(path);

    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_active.fetch_max(active, Ordering::SeqCst);
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self.active.fetch_sub(1, Ordering::SeqCst);

    result
  }
}

/// In-memory notification backend.
#[derive(Default)]
pub struct FakeNotifications {
  next_id: AtomicU64,
  live: Mutex<BTreeMap<String, (DateTime<Utc>, Value)>>,
  fail_schedule: AtomicBool,
  fail_cancel: AtomicBool,
  pub schedule_calls: AtomicUsize,
  pub cancel_calls: AtomicUsize,
}

impl FakeNotifications {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn fail_schedule(&self, fail: bool) {
    self.fail_schedule.store(fail, Ordering::SeqCst);
  }

  pub fn fail_cancel(&self, fail: bool) {
    self.fail_cancel.store(fail, Ordering::SeqCst);
  }

  pub fn live_count(&self) -> usize {
    self.live.lock().unwrap().len()
  }

  /// Fire times of live reminders for `entity_id`, earliest first.
  pub fn live_for(&self, entity_id: &str) -> Vec<DateTime<Utc>> {
    let mut times: Vec<_> = self
      .live
      .lock()
      .unwrap()
      .values()
      .filter(|(_, payload)| payload.get("entity_id").and_then(Value::as_str) == Some(entity_id))
      .map(|(fire_at, _)| *fire_at)
      .collect();
    times.sort();
    times
  }

  /// Schedule something that did not come from the reminder scheduler.
  pub fn insert_foreign(&self, fire_at: DateTime<Utc>, payload: Value) -> NotificationId {
    let id = format!("foreign-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
    self
      .live
      .lock()
      .unwrap()
      .insert(id.clone(), (fire_at, payload));
    NotificationId(id)
  }

  pub fn is_live(&self, id: &NotificationId) -> bool {
    self.live.lock().unwrap().contains_key(&id.0)
  }
}

#[async_trait]
impl NotificationService for FakeNotifications {
  async fn schedule(
    &self,
    fire_at: DateTime<Utc>,
    payload: &ReminderPayload,
  ) -> Result<NotificationId> {
    self.schedule_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_schedule.load(Ordering::SeqCst) {
      return Err(eyre!("notification permission denied"));
    }
    let id = format!("n{}", self.next_id.fetch_add(1, Ordering::SeqCst));
    let payload = serde_json::to_value(payload)?;
    self
      .live
      .lock()
      .unwrap()
      .insert(id.clone(), (fire_at, payload));
    Ok(NotificationId(id))
  }

  async fn cancel(&self, id: &NotificationId) -> Result<()> {
    self.cancel_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_cancel.load(Ordering::SeqCst) {
      return Err(eyre!("notification backend unavailable"));
    }
    self.live.lock().unwrap().remove(&id.0);
    Ok(())
  }

  async fn list_all(&self) -> Result<Vec<PendingNotification>> {
    Ok(
      self
        .live
        .lock()
        .unwrap()
        .iter()
        .map(|(id, (fire_at, payload))| PendingNotification {
          id: NotificationId(id.clone()),
          fire_at: *fire_at,
          payload: payload.clone(),
        })
        .collect(),
    )
  }
}
