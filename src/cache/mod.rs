//! Local-first cache of server-derived records.
//!
//! This module provides a per-resource caching mechanism that:
//! - Serves in-memory values while they are younger than the TTL
//! - Refreshes stale values with at most one request per read
//! - Coalesces concurrent reads onto a single in-flight request
//! - Provides basic offline mode (serve stale cache when network unavailable)
//! - Persists the last known-good value so it survives restarts

mod record;
mod registry;
mod traits;

pub use record::{CacheSettings, CachedRecord, RecordCache};
pub use registry::{CacheHandle, CacheRegistry};
pub use traits::{CacheError, CacheResult, CacheSource, CacheState, Cacheable};
