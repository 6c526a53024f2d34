//! Two-tier cache manager: a memory map in front of the persistent repository.

use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::storage::KeyValueRepository;
use super::traits::{CacheEntry, CacheResult, CacheSource};
use crate::error::{Result, SyncError};

/// Prefix for cache entries in the persistent repository.
const CACHE_KEY_PREFIX: &str = "cache_";

/// Cache manager with per-entry expiry and offline fallback.
///
/// Every mutation is written through to the repository before the call
/// returns. The memory map is the only shared mutable state and sits behind a
/// mutex that is never held across an await.
pub struct CacheManager {
  repository: Arc<dyn KeyValueRepository>,
  memory: Mutex<HashMap<String, CacheEntry>>,
  default_ttl: Duration,
}

impl CacheManager {
  /// Create a new cache manager on top of the given repository.
  pub fn new(repository: Arc<dyn KeyValueRepository>) -> Self {
    Self {
      repository,
      memory: Mutex::new(HashMap::new()),
      default_ttl: Duration::hours(24),
    }
  }

  /// Set the TTL used when callers pass `None`.
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Return the cached value for `key`, fetching it when the memory entry is
  /// missing, expired, or `force_refresh` is set.
  ///
  /// When the fetch fails the manager degrades in order: unexpired disk entry,
  /// then any expired memory entry, then the fetch error itself.
  pub async fn get_or_fetch<T, F, Fut>(
    &self,
    key: &str,
    fetch: F,
    ttl: Option<Duration>,
    force_refresh: bool,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    check_key(key)?;

    if !force_refresh {
      if let Some(entry) = self.memory_entry(key) {
        if !entry.is_expired() {
          if let Some(data) = decode::<T>(key, &entry) {
            debug!(key, "cache hit (memory)");
            return Ok(CacheResult::new(data, CacheSource::Memory));
          }
        }
      }
    }

    let fetch_error = match fetch().await {
      Ok(data) => {
        match serde_json::to_string(&data) {
          Ok(payload) => {
            let entry = self.new_entry(payload, ttl);
            if let Err(e) = self.store(key, entry) {
              warn!(key, error = %e, "fetched data could not be persisted");
            }
          }
          Err(e) => warn!(key, error = %e, "fetched data could not be serialized, not cached"),
        }
        debug!(key, "cache filled from fetch");
        return Ok(CacheResult::new(data, CacheSource::Network));
      }
      Err(e) => e,
    };

    warn!(key, error = %fetch_error, "fetch failed, falling back to cached data");

    if let Some(entry) = self.disk_entry(key) {
      if !entry.is_expired() {
        if let Some(data) = decode::<T>(key, &entry) {
          self.lock_memory().insert(key.to_string(), entry);
          debug!(key, "recovered from disk cache");
          return Ok(CacheResult::new(data, CacheSource::Disk));
        }
      }
    }

    if let Some(entry) = self.memory_entry(key) {
      if let Some(data) = decode::<T>(key, &entry) {
        warn!(key, expired_at = %entry.expires_at, "serving stale cache entry");
        return Ok(CacheResult::new(data, CacheSource::Stale));
      }
    }

    error!(key, "no cached data available");
    Err(fetch_error)
  }

  /// Store a value with the given TTL (default when `None`).
  pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
    check_key(key)?;
    let payload = serde_json::to_string(value)?;
    let entry = self.new_entry(payload, ttl);
    self.store(key, entry)?;
    debug!(key, "cache set");
    Ok(())
  }

  /// Read a value without fetching. Expired entries are only returned when
  /// `include_expired` is set.
  pub fn get<T: DeserializeOwned>(&self, key: &str, include_expired: bool) -> Option<T> {
    if key.is_empty() {
      return None;
    }

    if let Some(entry) = self.memory_entry(key) {
      if include_expired || !entry.is_expired() {
        return decode(key, &entry);
      }
    }

    let entry = self.disk_entry(key)?;
    if !include_expired && entry.is_expired() {
      return None;
    }
    let data = decode(key, &entry)?;
    self.lock_memory().insert(key.to_string(), entry);
    Some(data)
  }

  /// Expiry of the entry currently held for `key`, if any.
  pub fn expires_at(&self, key: &str) -> Option<chrono::DateTime<Utc>> {
    self
      .memory_entry(key)
      .or_else(|| self.disk_entry(key))
      .map(|e| e.expires_at)
  }

  /// Drop `key` from both tiers.
  pub fn remove(&self, key: &str) {
    if key.is_empty() {
      return;
    }
    self.lock_memory().remove(key);
    if let Err(e) = self.repository.remove(&storage_key(key)) {
      error!(key, error = %e, "failed to remove persisted cache entry");
    }
  }

  /// Drop every entry from both tiers. Returns the number of persisted
  /// entries removed.
  pub fn clear(&self) -> usize {
    self.lock_memory().clear();

    let keys = match self.repository.keys_with_prefix(CACHE_KEY_PREFIX) {
      Ok(keys) => keys,
      Err(e) => {
        error!(error = %e, "failed to list persisted cache entries");
        return 0;
      }
    };

    let mut removed = 0;
    for key in keys {
      match self.repository.remove(&key) {
        Ok(()) => removed += 1,
        Err(e) => error!(key = %key, error = %e, "failed to remove persisted cache entry"),
      }
    }
    debug!(removed, "cache cleared");
    removed
  }

  /// Number of entries held in memory.
  pub fn memory_len(&self) -> usize {
    self.lock_memory().len()
  }

  fn new_entry(&self, payload: String, ttl: Option<Duration>) -> CacheEntry {
    CacheEntry {
      payload,
      expires_at: Utc::now() + ttl.unwrap_or(self.default_ttl),
    }
  }

  /// Write through to the repository, then update memory. Memory is left
  /// untouched when the write fails.
  fn store(&self, key: &str, entry: CacheEntry) -> Result<()> {
    let serialized = serde_json::to_string(&entry)?;
    self
      .repository
      .write(&storage_key(key), &serialized)
      .map_err(SyncError::storage)?;
    self.lock_memory().insert(key.to_string(), entry);
    Ok(())
  }

  fn memory_entry(&self, key: &str) -> Option<CacheEntry> {
    self.lock_memory().get(key).cloned()
  }

  fn disk_entry(&self, key: &str) -> Option<CacheEntry> {
    let raw = match self.repository.read(&storage_key(key)) {
      Ok(raw) => raw?,
      Err(e) => {
        error!(key, error = %e, "failed to read persisted cache entry");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(key, error = %e, "discarding corrupt persisted cache entry");
        None
      }
    }
  }

  fn lock_memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    // A panic while holding the lock cannot leave a half-written entry
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn check_key(key: &str) -> Result<()> {
  if key.is_empty() {
    return Err(SyncError::invalid_argument("cache key must not be empty"));
  }
  Ok(())
}

fn storage_key(key: &str) -> String {
  format!("{}{}", CACHE_KEY_PREFIX, key)
}

fn decode<T: DeserializeOwned>(key: &str, entry: &CacheEntry) -> Option<T> {
  match serde_json::from_str(&entry.payload) {
    Ok(data) => Some(data),
    Err(e) => {
      warn!(key, error = %e, "cached payload does not match requested type");
      None
    }
  }
}
