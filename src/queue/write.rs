use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::remote::{Method, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMethod {
  Create,
  Update,
  Delete,
}

impl WriteMethod {
  pub fn http_method(self) -> Method {
    match self {
      Self::Create => Method::Post,
      Self::Update => Method::Put,
      Self::Delete => Method::Delete,
    }
  }
}

/// A mutation waiting for server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWrite {
  /// Locally generated, stable across retries
  pub id: String,
  /// Logical resource the write targets; writes to one resource are delivered in order
  pub resource: String,
  pub method: WriteMethod,
  /// Endpoint the write is sent to
  pub path: String,
  pub payload: Value,
  pub attempts: u32,
  pub last_error: Option<RemoteError>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedWrite {
  pub fn new(
    resource: impl Into<String>,
    method: WriteMethod,
    path: impl Into<String>,
    payload: Value,
    enqueued_at: DateTime<Utc>,
  ) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      resource: resource.into(),
      method,
      path: path.into(),
      payload,
      attempts: 0,
      last_error: None,
      enqueued_at,
    }
  }

  /// Body to send; deletes usually carry none.
  pub fn body(&self) -> Option<&Value> {
    if self.payload.is_null() {
      None
    } else {
      Some(&self.payload)
    }
  }
}

/// Where a write stands after `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
  /// Confirmed by the server
  Delivered,
  /// Stored locally, waiting for a later flush
  Pending,
  /// Rejected for good; waiting for the user to acknowledge it
  Failed,
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
  pub delivered: Vec<String>,
  pub failed: Vec<String>,
  /// Retryable error that stopped the pass
  pub stalled_on: Option<RemoteError>,
  /// Writes still queued after the pass
  pub remaining: usize,
}
