//! Remote API boundary.
//!
//! Every call returns either a response or a classified [`RemoteError`];
//! callers decide between retrying and surfacing based on
//! [`RemoteError::is_retryable`].

mod http;

pub use http::{EnvTokenProvider, HttpRemoteClient, TokenProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
  pub timeout: Duration,
}

/// Successful response. `data` is `None` for empty bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
  pub status: u16,
  pub data: Option<Value>,
}

/// Classified failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RemoteError {
  #[error("network unavailable: {0}")]
  Network(String),
  #[error("request timed out")]
  Timeout,
  #[error("session expired")]
  Unauthorized,
  #[error("rejected by server ({status}): {message}")]
  Validation { status: u16, message: String },
  #[error("server error ({status})")]
  ServerError { status: u16 },
  #[error("unreadable response: {0}")]
  Decode(String),
}

impl RemoteError {
  /// Network, timeout and 5xx failures may succeed on a later attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::Network(_) | Self::Timeout | Self::ServerError { .. }
    )
  }

  /// Classify a non-success HTTP status. Returns `None` for 2xx/3xx.
  ///
  /// 408 is treated as a timeout and 429 as server overload, both retryable;
  /// any other 4xx is a terminal rejection.
  pub fn from_status(status: u16, body: Option<&Value>) -> Option<Self> {
    match status {
      401 => Some(Self::Unauthorized),
      408 => Some(Self::Timeout),
      429 => Some(Self::ServerError { status }),
      400..=499 => Some(Self::Validation {
        status,
        message: body.and_then(error_message).unwrap_or_default(),
      }),
      500..=599 => Some(Self::ServerError { status }),
      _ => None,
    }
  }
}

/// Pull a human-readable message out of a typical JSON error body.
fn error_message(body: &Value) -> Option<String> {
  ["message", "error", "detail"]
    .iter()
    .find_map(|field| body.get(field).and_then(Value::as_str))
    .map(String::from)
}

/// Performs authenticated calls against the care API.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
    options: RequestOptions,
  ) -> Result<RemoteResponse, RemoteError>;
}
