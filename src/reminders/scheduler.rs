use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::plan::{plan, PlannedReminder};
use super::service::{NotificationId, NotificationService, ReminderPayload};
use crate::clock::Clock;
use crate::event::{Event, EventSender};

/// Something reminders can be attached to, e.g. an appointment.
pub trait ReminderTarget {
  fn entity_id(&self) -> &str;
  fn scheduled_time(&self) -> DateTime<Utc>;
  fn reminders_enabled(&self) -> bool;
}

/// Reminders this process believes are live for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReminderSet {
  pub entity_id: String,
  pub planned: Vec<PlannedReminder>,
  /// Accepted by the backend, keyed by fire time
  pub scheduled: BTreeMap<DateTime<Utc>, NotificationId>,
  /// Cancels that failed; retried on the next sync
  pub stranded: Vec<NotificationId>,
}

impl ReminderSet {
  fn new(entity_id: &str) -> Self {
    Self {
      entity_id: entity_id.to_string(),
      ..Self::default()
    }
  }

  fn is_empty(&self) -> bool {
    self.scheduled.is_empty() && self.stranded.is_empty()
  }

  fn owns(&self, id: &NotificationId) -> bool {
    self.scheduled.values().any(|known| known == id) || self.stranded.contains(id)
  }

  fn forget(&mut self, id: &NotificationId) {
    self.scheduled.retain(|_, known| known != id);
    self.stranded.retain(|known| known != id);
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
  pub scheduled: usize,
  pub cancelled: usize,
  /// Problems reported to the user; the triggering action still succeeded
  pub warnings: Vec<String>,
}

/// Keeps local notifications in step with the entities they belong to.
///
/// Every change cancels what was scheduled before and schedules afresh, so
/// running `sync` twice leaves exactly one notification per planned time.
pub struct ReminderScheduler {
  notifications: Arc<dyn NotificationService>,
  clock: Arc<dyn Clock>,
  events: EventSender,
  sets: Mutex<HashMap<String, ReminderSet>>,
  /// One async lock per entity; held across backend calls
  locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReminderScheduler {
  pub fn new(
    notifications: Arc<dyn NotificationService>,
    clock: Arc<dyn Clock>,
    events: EventSender,
  ) -> Self {
    Self {
      notifications,
      clock,
      events,
      sets: Mutex::new(HashMap::new()),
      locks: tokio::sync::Mutex::new(HashMap::new()),
    }
  }

  /// Bring the reminders for `target` in line with its current time and flag.
  pub async fn sync(&self, target: &(impl ReminderTarget + Sync)) -> SyncOutcome {
    let entity_id = target.entity_id();
    let guard = self.acquire(entity_id).await;
    let mut outcome = SyncOutcome::default();

    let stranded = self.cancel_recorded(entity_id, &mut outcome).await;
    let mut set = ReminderSet {
      stranded,
      ..ReminderSet::new(entity_id)
    };

    if target.reminders_enabled() {
      set.planned = plan(target.scheduled_time(), self.clock.now());
      for reminder in set.planned.clone() {
        let payload = ReminderPayload {
          entity_id: entity_id.to_string(),
          kind: reminder.kind,
        };
        match self.notifications.schedule(reminder.fire_at, &payload).await {
          Ok(id) => {
            set.scheduled.insert(reminder.fire_at, id);
            outcome.scheduled += 1;
          }
          Err(e) => self.report(
            entity_id,
            format!("Could not schedule reminder for {}: {}", reminder.fire_at, e),
            &mut outcome,
          ),
        }
      }
    }

    debug!(
      entity_id,
      scheduled = outcome.scheduled,
      cancelled = outcome.cancelled,
      "reminders synced"
    );
    self.store(set);
    self.release(entity_id, guard).await;
    outcome
  }

  /// Cancel every reminder for `entity_id` (entity deleted).
  pub async fn clear(&self, entity_id: &str) -> SyncOutcome {
    let guard = self.acquire(entity_id).await;
    let mut outcome = SyncOutcome::default();

    let stranded = self.cancel_recorded(entity_id, &mut outcome).await;
    self.store(ReminderSet {
      stranded,
      ..ReminderSet::new(entity_id)
    });
    self.release(entity_id, guard).await;
    outcome
  }

  /// Cancel everything this scheduler knows about (logout).
  pub async fn clear_all(&self) -> SyncOutcome {
    let entity_ids: Vec<String> = self.sets().keys().cloned().collect();
    let mut total = SyncOutcome::default();

    for entity_id in entity_ids {
      let outcome = self.clear(&entity_id).await;
      total.cancelled += outcome.cancelled;
      total.warnings.extend(outcome.warnings);
    }

    info!(cancelled = total.cancelled, "cleared all reminders");
    total
  }

  /// Cancel pending reminders whose entity is not in `live_entity_ids`.
  ///
  /// Only notifications carrying a [`ReminderPayload`] are considered. Never
  /// runs on its own; the host calls it after loading the full entity list.
  pub async fn reconcile(&self, live_entity_ids: &HashSet<String>) -> Result<usize> {
    let pending = self.notifications.list_all().await?;
    let mut cancelled = 0;

    for notification in pending {
      let Some(payload) = ReminderPayload::from_value(&notification.payload) else {
        continue;
      };
      if live_entity_ids.contains(&payload.entity_id) {
        continue;
      }

      let guard = self.acquire(&payload.entity_id).await;
      match self.notifications.cancel(&notification.id).await {
        Ok(()) => {
          cancelled += 1;
          let mut sets = self.sets();
          if let Some(set) = sets.get_mut(&payload.entity_id) {
            set.forget(&notification.id);
            if set.is_empty() {
              sets.remove(&payload.entity_id);
            }
          }
        }
        Err(e) => warn!(
          entity_id = %payload.entity_id,
          notification = %notification.id,
          error = %e,
          "failed to cancel orphaned reminder"
        ),
      }
      self.release(&payload.entity_id, guard).await;
    }

    info!(cancelled, "reconciled reminders");
    Ok(cancelled)
  }

  /// Adopt reminders scheduled by an earlier process so later syncs can
  /// cancel them. Returns how many were adopted.
  pub async fn restore(&self) -> Result<usize> {
    let pending = self.notifications.list_all().await?;
    let mut adopted = 0;
    let mut sets = self.sets();

    for notification in pending {
      let Some(payload) = ReminderPayload::from_value(&notification.payload) else {
        continue;
      };
      let set = sets
        .entry(payload.entity_id.clone())
        .or_insert_with(|| ReminderSet::new(&payload.entity_id));
      if set.owns(&notification.id) {
        continue;
      }

      if set.scheduled.contains_key(&notification.fire_at) {
        // duplicate left behind by an interrupted sync
        set.stranded.push(notification.id);
      } else {
        set.planned.push(PlannedReminder {
          kind: payload.kind,
          fire_at: notification.fire_at,
        });
        set.planned.sort_by_key(|reminder| reminder.fire_at);
        set.scheduled.insert(notification.fire_at, notification.id);
      }
      adopted += 1;
    }

    info!(adopted, "restored reminders");
    Ok(adopted)
  }

  pub fn planned(&self, entity_id: &str) -> Option<ReminderSet> {
    self.sets().get(entity_id).cloned()
  }

  /// Cancel the recorded ids for `entity_id`, returning those that could not
  /// be cancelled.
  async fn cancel_recorded(
    &self,
    entity_id: &str,
    outcome: &mut SyncOutcome,
  ) -> Vec<NotificationId> {
    let previous = self.sets().remove(entity_id).unwrap_or_default();
    let mut stranded = Vec::new();

    for id in previous.scheduled.into_values().chain(previous.stranded) {
      match self.notifications.cancel(&id).await {
        Ok(()) => outcome.cancelled += 1,
        Err(e) => {
          self.report(
            entity_id,
            format!("Could not cancel reminder {}: {}", id, e),
            outcome,
          );
          stranded.push(id);
        }
      }
    }
    stranded
  }

  fn store(&self, set: ReminderSet) {
    let mut sets = self.sets();
    if set.is_empty() {
      sets.remove(&set.entity_id);
    } else {
      sets.insert(set.entity_id.clone(), set);
    }
  }

  fn report(&self, entity_id: &str, message: String, outcome: &mut SyncOutcome) {
    warn!(entity_id, %message, "reminder not updated");
    let _ = self.events.send(Event::ReminderWarning {
      entity_id: entity_id.to_string(),
      message: message.clone(),
    });
    outcome.warnings.push(message);
  }

  async fn acquire(&self, entity_id: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut locks = self.locks.lock().await;
      Arc::clone(
        locks
          .entry(entity_id.to_string())
          .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
      )
    };
    lock.lock_owned().await
  }

  /// Drop the entity's lock, removing it from the map when nobody else is
  /// holding or waiting on it.
  async fn release(&self, entity_id: &str, guard: OwnedMutexGuard<()>) {
    let mut locks = self.locks.lock().await;
    // one reference in the map, one in our guard
    let idle = locks
      .get(entity_id)
      .is_some_and(|lock| Arc::strong_count(lock) == 2);
    if idle {
      locks.remove(entity_id);
    }
    drop(guard);
  }

  fn sets(&self) -> MutexGuard<'_, HashMap<String, ReminderSet>> {
    self.sets.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::EventHandler;
  use crate::testing::{start_time, FakeNotifications, ManualClock};
  use chrono::Duration;
  use serde_json::json;
  use std::sync::atomic::Ordering;

  struct Visit {
    id: String,
    at: DateTime<Utc>,
    enabled: bool,
  }

  impl ReminderTarget for Visit {
    fn entity_id(&self) -> &str {
      &self.id
    }

    fn scheduled_time(&self) -> DateTime<Utc> {
      self.at
    }

    fn reminders_enabled(&self) -> bool {
      self.enabled
    }
  }

  fn visit(id: &str, from_now: Duration) -> Visit {
    Visit {
      id: id.to_string(),
      at: start_time() + from_now,
      enabled: true,
    }
  }

  struct Harness {
    notifications: Arc<FakeNotifications>,
    events: EventHandler,
    scheduler: ReminderScheduler,
  }

  fn harness() -> Harness {
    let notifications = FakeNotifications::new();
    let events = EventHandler::new();
    let scheduler = ReminderScheduler::new(
      notifications.clone(),
      ManualClock::new(start_time()),
      events.sender(),
    );
    Harness {
      notifications,
      events,
      scheduler,
    }
  }

  #[tokio::test]
  async fn test_schedules_day_and_hour_before() {
    let h = harness();
    let checkup = visit("a", Duration::days(3));

    let outcome = h.scheduler.sync(&checkup).await;

    assert_eq!(outcome.scheduled, 2);
    assert_eq!(
      h.notifications.live_for("a"),
      vec![checkup.at - Duration::hours(24), checkup.at - Duration::hours(1)]
    );
  }

  #[tokio::test]
  async fn test_inside_day_window_schedules_hour_before_only() {
    let h = harness();
    let checkup = visit("a", Duration::hours(5));

    h.scheduler.sync(&checkup).await;

    assert_eq!(h.notifications.live_for("a"), vec![checkup.at - Duration::hours(1)]);
  }

  #[tokio::test]
  async fn test_sync_twice_keeps_one_per_time() {
    let h = harness();
    let checkup = visit("a", Duration::days(3));

    h.scheduler.sync(&checkup).await;
    let second = h.scheduler.sync(&checkup).await;

    assert_eq!(second.cancelled, 2);
    assert_eq!(second.scheduled, 2);
    assert_eq!(h.notifications.live_count(), 2);
    assert_eq!(h.scheduler.planned("a").unwrap().scheduled.len(), 2);
  }

  #[tokio::test]
  async fn test_new_time_replaces_old_reminders() {
    let h = harness();
    let mut checkup = visit("a", Duration::days(3));
    h.scheduler.sync(&checkup).await;

    checkup.at = start_time() + Duration::days(7);
    h.scheduler.sync(&checkup).await;

    assert_eq!(
      h.notifications.live_for("a"),
      vec![checkup.at - Duration::hours(24), checkup.at - Duration::hours(1)]
    );
  }

  #[tokio::test]
  async fn test_disabling_cancels_everything() {
    let h = harness();
    let mut checkup = visit("a", Duration::days(3));
    h.scheduler.sync(&checkup).await;

    checkup.enabled = false;
    let outcome = h.scheduler.sync(&checkup).await;

    assert_eq!(outcome.cancelled, 2);
    assert_eq!(h.notifications.live_count(), 0);
    assert!(h.scheduler.planned("a").is_none());
  }

  #[tokio::test]
  async fn test_clear_after_delete() {
    let h = harness();
    h.scheduler.sync(&visit("a", Duration::days(3))).await;
    h.scheduler.sync(&visit("b", Duration::days(4))).await;

    h.scheduler.clear("a").await;

    assert!(h.notifications.live_for("a").is_empty());
    assert_eq!(h.notifications.live_for("b").len(), 2);
  }

  #[tokio::test]
  async fn test_schedule_failure_is_a_warning() {
    let mut h = harness();
    h.notifications.fail_schedule(true);

    let outcome = h.scheduler.sync(&visit("a", Duration::days(3))).await;

    assert_eq!(outcome.scheduled, 0);
    assert_eq!(outcome.warnings.len(), 2);
    let warnings = h
      .events
      .pending()
      .into_iter()
      .filter(|e| matches!(e, Event::ReminderWarning { entity_id, .. } if entity_id == "a"))
      .count();
    assert_eq!(warnings, 2);
  }

  #[tokio::test]
  async fn test_reconcile_cancels_orphans_only() {
    let h = harness();
    h.scheduler.sync(&visit("a", Duration::days(3))).await;
    h.scheduler.sync(&visit("b", Duration::days(4))).await;
    let foreign = h
      .notifications
      .insert_foreign(start_time() + Duration::days(1), json!({ "pill": "folic acid" }));

    let live: HashSet<String> = ["a".to_string()].into_iter().collect();
    let cancelled = h.scheduler.reconcile(&live).await.unwrap();

    assert_eq!(cancelled, 2);
    assert_eq!(h.notifications.live_for("a").len(), 2);
    assert!(h.notifications.live_for("b").is_empty());
    assert!(h.notifications.is_live(&foreign));
    assert!(h.scheduler.planned("b").is_none());
  }

  #[tokio::test]
  async fn test_restore_lets_new_process_cancel() {
    let h = harness();
    h.scheduler.sync(&visit("a", Duration::days(3))).await;

    let relaunched = ReminderScheduler::new(
      h.notifications.clone(),
      ManualClock::new(start_time()),
      EventHandler::new().sender(),
    );
    assert_eq!(relaunched.restore().await.unwrap(), 2);
    assert_eq!(relaunched.restore().await.unwrap(), 0);

    relaunched.clear("a").await;
    assert_eq!(h.notifications.live_count(), 0);
  }

  #[tokio::test]
  async fn test_clear_all_cancels_every_entity() {
    let h = harness();
    h.scheduler.sync(&visit("a", Duration::days(3))).await;
    h.scheduler.sync(&visit("b", Duration::days(4))).await;

    let outcome = h.scheduler.clear_all().await;

    assert_eq!(outcome.cancelled, 4);
    assert_eq!(h.notifications.live_count(), 0);
    assert_eq!(h.notifications.cancel_calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn test_failed_cancel_is_retried() {
    let h = harness();
    h.scheduler.sync(&visit("a", Duration::days(3))).await;
    h.notifications.fail_cancel(true);

    let outcome = h.scheduler.sync(&visit("a", Duration::days(5))).await;

    assert_eq!(outcome.cancelled, 0);
    assert_eq!(outcome.warnings.len(), 2);
    assert_eq!(h.notifications.live_count(), 4);
    let set = h.scheduler.planned("a").unwrap();
    assert_eq!(set.stranded.len(), 2);
    assert_eq!(set.scheduled.len(), 2);

    h.notifications.fail_cancel(false);
    let outcome = h.scheduler.clear("a").await;

    assert_eq!(outcome.cancelled, 4);
    assert!(outcome.warnings.is_empty());
    assert_eq!(h.notifications.live_count(), 0);
    assert!(h.scheduler.planned("a").is_none());
  }

  #[tokio::test]
  async fn test_entity_locks_are_dropped_when_idle() {
    let h = harness();
    h.scheduler.sync(&visit("a", Duration::days(3))).await;
    h.scheduler.sync(&visit("b", Duration::days(4))).await;
    h.scheduler.clear("a").await;
    h.scheduler.clear_all().await;

    assert!(h.scheduler.locks.lock().await.is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_syncs_for_one_entity() {
    let h = harness();
    let first = visit("a", Duration::days(3));
    let second = visit("a", Duration::days(5));

    tokio::join!(h.scheduler.sync(&first), h.scheduler.sync(&second));

    assert_eq!(h.notifications.live_count(), 2);
  }
}
