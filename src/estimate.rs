//! Values the app can work out locally when the server's answer is missing.
//!
//! A locally computed value is always an [`Reading::Estimated`], and anything
//! derived from it stays estimated, so the UI can say which one it shows.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Length of a pregnancy counted from the first day of the last period.
pub const PREGNANCY_DAYS: i64 = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum Reading<T> {
  ServerConfirmed(T),
  Estimated(T),
}

impl<T> Reading<T> {
  pub fn value(&self) -> &T {
    match self {
      Self::ServerConfirmed(value) | Self::Estimated(value) => value,
    }
  }

  pub fn into_value(self) -> T {
    match self {
      Self::ServerConfirmed(value) | Self::Estimated(value) => value,
    }
  }

  pub fn is_estimate(&self) -> bool {
    matches!(self, Self::Estimated(_))
  }

  /// Derive a new value, keeping the label.
  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
    match self {
      Self::ServerConfirmed(value) => Reading::ServerConfirmed(f(value)),
      Self::Estimated(value) => Reading::Estimated(f(value)),
    }
  }
}

/// Naegele's rule.
pub fn estimate_due_date(last_period: NaiveDate) -> NaiveDate {
  last_period + Duration::days(PREGNANCY_DAYS)
}

/// The server's due date if there is one, otherwise an estimate from the
/// last period.
pub fn due_date(server: Option<NaiveDate>, last_period: Option<NaiveDate>) -> Option<Reading<NaiveDate>> {
  match (server, last_period) {
    (Some(date), _) => Some(Reading::ServerConfirmed(date)),
    (None, Some(lmp)) => Some(Reading::Estimated(estimate_due_date(lmp))),
    (None, None) => None,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestationalAge {
  pub weeks: u32,
  pub days: u32,
}

/// Completed weeks and days on `today` for a pregnancy due on `due`.
///
/// `None` before the pregnancy started or more than six weeks past due.
pub fn gestational_age(due: Reading<NaiveDate>, today: NaiveDate) -> Option<Reading<GestationalAge>> {
  let start = *due.value() - Duration::days(PREGNANCY_DAYS);
  let elapsed = (today - start).num_days();
  if !(0..PREGNANCY_DAYS + 42).contains(&elapsed) {
    return None;
  }
  let elapsed = u32::try_from(elapsed).ok()?;
  Some(due.map(|_| GestationalAge {
    weeks: elapsed / 7,
    days: elapsed % 7,
  }))
}
