//! The instance graph, built once at startup and torn down at logout.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::appointments::Appointments;
use crate::cache::{CacheRegistry, CacheSettings};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::event::{Event, EventSender};
use crate::queue::{FlushReport, QueueSettings, QueuedWrite, WriteQueue};
use crate::reminders::{NotificationService, ReminderScheduler};
use crate::remote::{EnvTokenProvider, HttpRemoteClient, RemoteClient};
use crate::store::{KeyValueStore, SqliteStore};

/// Collaborators supplied by the host.
pub struct Dependencies {
  pub remote: Arc<dyn RemoteClient>,
  pub store: Arc<dyn KeyValueStore>,
  pub notifications: Arc<dyn NotificationService>,
  pub clock: Arc<dyn Clock>,
}

/// Everything a signed-in session needs.
///
/// Call [`Careline::start`] once after construction, the lifecycle hooks as
/// the app moves between foreground and background, and [`Careline::logout`]
/// when the user signs out.
#[derive(Clone)]
pub struct Careline {
  caches: CacheRegistry,
  queue: WriteQueue,
  reminders: Arc<ReminderScheduler>,
  appointments: Appointments,
  events: EventSender,
}

impl Careline {
  pub fn new(config: &Config, deps: Dependencies, events: EventSender) -> Self {
    let caches = CacheRegistry::new(
      Arc::clone(&deps.remote),
      Arc::clone(&deps.store),
      Arc::clone(&deps.clock),
      CacheSettings::from_config(config),
    )
    .with_events(events.clone());

    let queue = WriteQueue::new(
      deps.remote,
      deps.store,
      caches.clone(),
      events.clone(),
      QueueSettings::from_config(config),
    );

    let reminders = Arc::new(ReminderScheduler::new(
      deps.notifications,
      Arc::clone(&deps.clock),
      events.clone(),
    ));

    let appointments = Appointments::new(
      caches.clone(),
      queue.clone(),
      Arc::clone(&reminders),
      deps.clock,
    );

    Self {
      caches,
      queue,
      reminders,
      appointments,
      events,
    }
  }

  /// Production wiring: SQLite storage, the HTTPS client and the system clock.
  pub fn connect(
    config: &Config,
    notifications: Arc<dyn NotificationService>,
    events: EventSender,
  ) -> Result<Self> {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    let remote = HttpRemoteClient::new(&config.remote, Arc::new(EnvTokenProvider))?;

    let deps = Dependencies {
      remote: Arc::new(remote),
      store: Arc::new(store),
      notifications,
      clock: Arc::new(SystemClock),
    };
    Ok(Self::new(config, deps, events))
  }

  pub fn caches(&self) -> &CacheRegistry {
    &self.caches
  }

  pub fn queue(&self) -> &WriteQueue {
    &self.queue
  }

  pub fn reminders(&self) -> &ReminderScheduler {
    &self.reminders
  }

  pub fn appointments(&self) -> &Appointments {
    &self.appointments
  }

  /// Reload what the last session left behind and try to deliver it.
  pub async fn start(&self) -> Result<FlushReport> {
    let restored = self.queue.restore().await?;
    if let Err(e) = self.reminders.restore().await {
      warn!(error = %e, "could not list scheduled reminders");
    }
    info!(restored, "session started");
    Ok(self.queue.flush().await)
  }

  pub async fn on_foreground(&self) -> FlushReport {
    self.queue.flush().await
  }

  pub async fn on_reconnect(&self) -> FlushReport {
    self.queue.flush().await
  }

  /// Tear down everything that belongs to the signed-in user.
  ///
  /// Writes that never reached the server are reported with
  /// [`Event::PendingDiscarded`] before they are dropped.
  pub async fn logout(&self) -> Vec<QueuedWrite> {
    let pending = self.queue.pending();
    if !pending.is_empty() {
      warn!(count = pending.len(), "discarding undelivered writes at logout");
      let _ = self.events.send(Event::PendingDiscarded(pending));
    }
    let discarded = self.queue.drain().await;

    self.reminders.clear_all().await;
    self.caches.clear_all().await;
    info!("logged out");
    discarded
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::appointments::Appointment;
  use crate::cache::{CacheState, RecordCache};
  use crate::event::EventHandler;
  use crate::queue::{WriteMethod, WriteStatus};
  use crate::store::MemoryStore;
  use crate::testing::{no_content, ok, start_time, FakeNotifications, FakeRemote, ManualClock};
  use chrono::Duration;
  use serde_json::{json, Value};

  fn config() -> Config {
    Config::from_yaml("remote:\n  url: https://api.example.com/v1\n").unwrap()
  }

  struct Harness {
    remote: Arc<FakeRemote>,
    store: Arc<MemoryStore>,
    notifications: Arc<FakeNotifications>,
    events: EventHandler,
    careline: Careline,
  }

  fn harness_on(store: Arc<MemoryStore>, remote: Arc<FakeRemote>) -> Harness {
    let notifications = FakeNotifications::new();
    let events = EventHandler::new();
    let deps = Dependencies {
      remote: remote.clone(),
      store: store.clone(),
      notifications: notifications.clone(),
      clock: ManualClock::new(start_time()),
    };
    let careline = Careline::new(&config(), deps, events.sender());
    Harness {
      remote,
      store,
      notifications,
      events,
      careline,
    }
  }

  fn harness() -> Harness {
    harness_on(Arc::new(MemoryStore::new()), FakeRemote::new())
  }

  fn appointment() -> Appointment {
    Appointment {
      id: "A".to_string(),
      title: "Glucose test".to_string(),
      scheduled_time: start_time() + Duration::days(2),
      reminders_enabled: true,
      location: Some("Clinic".to_string()),
      notes: None,
    }
  }

  #[tokio::test]
  async fn test_logout_clears_everything() {
    let mut h = harness();
    h.remote.always("appointments", no_content());
    h.careline.appointments().create(&appointment()).await.unwrap();
    let profile: RecordCache<Value> = h.careline.caches().record("profile", "profile");
    profile.seed(json!({ "name": "Ada" })).await;
    // offline by default
    h.careline.appointments().update(&appointment()).await.unwrap();
    h.events.pending();

    let discarded = h.careline.logout().await;

    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].method, WriteMethod::Update);
    assert!(h.careline.queue().pending().is_empty());
    assert_eq!(h.notifications.live_count(), 0);
    assert_eq!(profile.state(), CacheState::Unavailable);
    assert!(h.store.is_empty());
    let events = h.events.pending();
    assert!(matches!(&events[0], Event::PendingDiscarded(writes) if writes.len() == 1));
  }

  #[tokio::test]
  async fn test_discard_notice_names_the_dropped_writes() {
    let mut h = harness();
    h.careline.appointments().update(&appointment()).await.unwrap();
    h.careline.appointments().delete("A").await;
    h.events.pending();

    let discarded = h.careline.logout().await;

    let events = h.events.pending();
    let Event::PendingDiscarded(notified) = &events[0] else {
      panic!("expected PendingDiscarded first, got {:?}", events[0]);
    };
    let notified: Vec<&str> = notified.iter().map(|w| w.id.as_str()).collect();
    let dropped: Vec<&str> = discarded.iter().map(|w| w.id.as_str()).collect();
    assert_eq!(notified, dropped);
    assert_eq!(dropped.len(), 2);
  }

  #[tokio::test]
  async fn test_start_delivers_writes_from_last_session() {
    let store = Arc::new(MemoryStore::new());
    let first = harness_on(store.clone(), FakeRemote::new());
    let status = first
      .careline
      .appointments()
      .update(&appointment())
      .await
      .unwrap()
      .status;
    assert_eq!(status, WriteStatus::Pending);

    let remote = FakeRemote::new();
    remote.push("appointments/A", ok(serde_json::to_value(appointment()).unwrap()));
    let second = harness_on(store, remote);
    let report = second.careline.start().await.unwrap();

    assert_eq!(report.delivered.len(), 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(second.remote.call_count("appointments/A"), 1);
  }

  #[tokio::test]
  async fn test_foreground_retries_pending_writes() {
    let h = harness();
    h.careline.appointments().update(&appointment()).await.unwrap();
    h.remote.push("appointments/A", no_content());

    let report = h.careline.on_foreground().await;

    assert_eq!(report.delivered.len(), 1);
  }
}
