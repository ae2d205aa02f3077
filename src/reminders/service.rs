use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::plan::ReminderKind;

/// Handle returned by the notification backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub String);

impl fmt::Display for NotificationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Attached to every reminder this crate schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderPayload {
  pub entity_id: String,
  pub kind: ReminderKind,
}

impl ReminderPayload {
  /// `None` for notifications scheduled by someone else.
  pub fn from_value(value: &Value) -> Option<Self> {
    serde_json::from_value(value.clone()).ok()
  }
}

/// A notification the backend still has queued.
#[derive(Debug, Clone)]
pub struct PendingNotification {
  pub id: NotificationId,
  pub fire_at: DateTime<Utc>,
  pub payload: Value,
}

/// Local notification backend provided by the host platform.
#[async_trait]
pub trait NotificationService: Send + Sync {
  async fn schedule(&self, fire_at: DateTime<Utc>, payload: &ReminderPayload)
    -> Result<NotificationId>;

  async fn cancel(&self, id: &NotificationId) -> Result<()>;

  async fn list_all(&self) -> Result<Vec<PendingNotification>>;
}
