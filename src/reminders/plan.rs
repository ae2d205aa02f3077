use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Which reminder before an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
  DayBefore,
  HourBefore,
}

impl ReminderKind {
  pub const ALL: [ReminderKind; 2] = [ReminderKind::DayBefore, ReminderKind::HourBefore];

  /// How long before the scheduled time this reminder fires.
  pub fn lead_time(self) -> Duration {
    match self {
      Self::DayBefore => Duration::hours(24),
      Self::HourBefore => Duration::hours(1),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedReminder {
  pub kind: ReminderKind,
  pub fire_at: DateTime<Utc>,
}

/// Reminders still ahead of `now` for something happening at `scheduled`,
/// earliest first.
pub fn plan(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> Vec<PlannedReminder> {
  let mut planned: Vec<PlannedReminder> = ReminderKind::ALL
    .iter()
    .map(|&kind| PlannedReminder {
      kind,
      fire_at: scheduled - kind.lead_time(),
    })
    .filter(|reminder| reminder.fire_at > now)
    .collect();
  planned.sort_by_key(|reminder| reminder.fire_at);
  planned
}
