//! Appointments: the one entity that drives the cache, the write queue and
//! reminders together.
//!
//! Saving never waits on the network. The write is queued durably, reminders
//! are rescheduled from the locally edited value, and the cache only picks up
//! the change once the server confirms it.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheError, CacheRegistry, CacheResult, RecordCache};
use crate::clock::Clock;
use crate::queue::{QueuedWrite, WriteMethod, WriteQueue, WriteStatus};
use crate::reminders::{ReminderScheduler, ReminderTarget, SyncOutcome};

const COLLECTION: &str = "appointments";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
  pub id: String,
  pub title: String,
  pub scheduled_time: DateTime<Utc>,
  #[serde(default)]
  pub reminders_enabled: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

impl ReminderTarget for Appointment {
  fn entity_id(&self) -> &str {
    &self.id
  }

  fn scheduled_time(&self) -> DateTime<Utc> {
    self.scheduled_time
  }

  fn reminders_enabled(&self) -> bool {
    self.reminders_enabled
  }
}

/// Turn a wall-clock time entered in `tz` into the instant reminders fire at.
///
/// Ambiguous times (clocks going back) resolve to the earlier instant; times
/// skipped by a DST jump return `None`.
pub fn instant_from_wall_clock<Tz: TimeZone>(tz: &Tz, wall_clock: NaiveDateTime) -> Option<DateTime<Utc>> {
  tz.from_local_datetime(&wall_clock)
    .earliest()
    .map(|t| t.with_timezone(&Utc))
}

/// Cache and queue resource name for one appointment.
pub fn resource(id: &str) -> String {
  format!("{}/{}", COLLECTION, id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
  pub status: WriteStatus,
  pub reminders: SyncOutcome,
}

#[derive(Clone)]
pub struct Appointments {
  caches: CacheRegistry,
  queue: WriteQueue,
  reminders: Arc<ReminderScheduler>,
  clock: Arc<dyn Clock>,
}

impl Appointments {
  pub fn new(
    caches: CacheRegistry,
    queue: WriteQueue,
    reminders: Arc<ReminderScheduler>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      caches,
      queue,
      reminders,
      clock,
    }
  }

  pub fn cache(&self, id: &str) -> RecordCache<Appointment> {
    let resource = resource(id);
    self.caches.record(&resource, &resource)
  }

  pub async fn load(&self, id: &str, force_refresh: bool) -> Result<CacheResult<Appointment>, CacheError> {
    self.cache(id).get(force_refresh).await
  }

  pub async fn create(&self, appointment: &Appointment) -> Result<SaveOutcome> {
    self.save(appointment, WriteMethod::Create, COLLECTION.to_string()).await
  }

  pub async fn update(&self, appointment: &Appointment) -> Result<SaveOutcome> {
    self
      .save(appointment, WriteMethod::Update, resource(&appointment.id))
      .await
  }

  pub async fn set_reminders(&self, appointment: &Appointment, enabled: bool) -> Result<SaveOutcome> {
    let toggled = Appointment {
      reminders_enabled: enabled,
      ..appointment.clone()
    };
    self.update(&toggled).await
  }

  pub async fn delete(&self, id: &str) -> SaveOutcome {
    let resource = resource(id);
    // registered so delivery can clear it
    self.cache(id);
    let write = QueuedWrite::new(
      resource.clone(),
      WriteMethod::Delete,
      resource,
      Value::Null,
      self.clock.now(),
    );

    let status = self.queue.enqueue(write).await;
    let reminders = self.reminders.clear(id).await;
    info!(appointment = id, ?status, "appointment deleted");
    SaveOutcome { status, reminders }
  }

  /// Cancel reminders for appointments that no longer exist.
  pub async fn reconcile(&self, appointments: &[Appointment]) -> Result<usize> {
    let live: HashSet<String> = appointments.iter().map(|a| a.id.clone()).collect();
    self.reminders.reconcile(&live).await
  }

  async fn save(&self, appointment: &Appointment, method: WriteMethod, path: String) -> Result<SaveOutcome> {
    let payload = serde_json::to_value(appointment)
      .map_err(|e| eyre!("Failed to serialize appointment {}: {}", appointment.id, e))?;
    self.cache(&appointment.id);
    let write = QueuedWrite::new(
      resource(&appointment.id),
      method,
      path,
      payload,
      self.clock.now(),
    );

    let status = self.queue.enqueue(write).await;
    // reminders follow the local edit whether or not the server has it yet
    let reminders = self.reminders.sync(appointment).await;
    info!(appointment = %appointment.id, ?method, ?status, "appointment saved");
    Ok(SaveOutcome { status, reminders })
  }
}
