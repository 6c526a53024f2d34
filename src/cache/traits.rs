//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached payload and its expiry. Owned by the cache manager, one per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  /// Serialized JSON of the cached value
  pub payload: String,
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_expired(&self) -> bool {
    self.expires_at < Utc::now()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn new(data: T, source: CacheSource) -> Self {
    Self { data, source }
  }

  /// Whether the data was served past its expiry.
  pub fn is_degraded(&self) -> bool {
    self.source == CacheSource::Stale
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh entry from the memory tier
  Memory,
  /// Fresh entry from the persistent tier, after the fetch failed
  Disk,
  /// Just fetched through the supplied fetch function
  Network,
  /// Expired memory entry, served because the fetch failed
  Stale,
}
