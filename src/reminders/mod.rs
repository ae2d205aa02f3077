//! Local reminders tied to the lifecycle of appointment-like entities.
//!
//! Each entity gets a reminder one day and one hour before it starts, minus
//! any that would already be in the past. Failures here are reported as
//! warnings and never fail the action that triggered them.

mod plan;
mod scheduler;
mod service;

pub use plan::{plan, PlannedReminder, ReminderKind};
pub use scheduler::{ReminderScheduler, ReminderSet, ReminderTarget, SyncOutcome};
pub use service::{NotificationId, NotificationService, PendingNotification, ReminderPayload};
