//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::remote::RemoteError;

/// Values that can be held in a [`RecordCache`](super::RecordCache).
///
/// Records are persisted as JSON, so anything serde can round-trip and share
/// across tasks qualifies.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Freshness of a cached record, derived from its age and the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
  /// Younger than the TTL and not invalidated
  Fresh,
  /// Present but past the TTL (or invalidated); still served as a fallback
  Stale,
  /// Never populated
  Unavailable,
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last confirmed by the server
  pub fetched_at: DateTime<Utc>,
  /// Refresh failure behind an offline result
  pub error: Option<RemoteError>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at,
      error: None,
    }
  }

  /// Create a new cache result from in-memory data that is still fresh.
  pub fn from_cache(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      fetched_at,
      error: None,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, fetched_at: DateTime<Utc>, error: RemoteError) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      fetched_at,
      error: Some(error),
    }
  }

  /// True when the UI should show its "may be out of date" indicator.
  pub fn is_degraded(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from memory, still considered fresh
  CacheFresh,
  /// Refresh failed; serving the last known value
  Offline,
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// Nothing cached and the refresh failed, so there is nothing to show
  #[error("{resource} is unavailable: {source}")]
  Unavailable {
    resource: String,
    source: RemoteError,
  },
}

impl CacheError {
  pub fn remote_error(&self) -> &RemoteError {
    match self {
      Self::Unavailable { source, .. } => source,
    }
  }
}
