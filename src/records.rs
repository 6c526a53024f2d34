//! Durable local copy of the user's records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::cache::KeyValueRepository;
use crate::error::{Result, SyncError};
use crate::model::EmotionRecord;

const RECORD_KEY_PREFIX: &str = "record_";

/// A record plus what the remote store last acknowledged for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
  pub record: EmotionRecord,
  #[serde(default)]
  pub last_synced_at: Option<DateTime<Utc>>,
  /// Version last known to be stored remotely. Conflict detection compares
  /// both sides against it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<EmotionRecord>,
}

impl LocalRecord {
  /// A record that has never reached the remote store.
  pub fn unsynced(record: EmotionRecord) -> Self {
    Self {
      record,
      last_synced_at: None,
      base: None,
    }
  }

  /// Whether the local version differs from the last acknowledged one.
  pub fn is_modified(&self) -> bool {
    self
      .base
      .as_ref()
      .map_or(true, |base| !self.record.content_eq(base))
  }
}

/// Local source of truth, keyed by local id and mirrored to the repository.
pub struct RecordStore {
  repository: Arc<dyn KeyValueRepository>,
  records: Mutex<BTreeMap<String, LocalRecord>>,
}

impl RecordStore {
  /// Load every persisted record. Unreadable entries are skipped.
  pub fn load(repository: Arc<dyn KeyValueRepository>) -> Result<Self> {
    let keys = repository
      .keys_with_prefix(RECORD_KEY_PREFIX)
      .map_err(SyncError::storage)?;

    let mut records = BTreeMap::new();
    for key in keys {
      let Some(raw) = repository.read(&key).map_err(SyncError::storage)? else {
        continue;
      };
      match serde_json::from_str::<LocalRecord>(&raw) {
        Ok(local) => {
          records.insert(local.record.local_id.clone(), local);
        }
        Err(e) => warn!(key = %key, error = %e, "skipping unreadable local record"),
      }
    }

    if !records.is_empty() {
      info!(count = records.len(), "loaded local records");
    }

    Ok(Self {
      repository,
      records: Mutex::new(records),
    })
  }

  pub fn get(&self, local_id: &str) -> Option<LocalRecord> {
    self.lock().get(local_id).cloned()
  }

  /// Insert or replace a record, persisting it before returning.
  pub fn put(&self, local: LocalRecord) -> Result<()> {
    let json = serde_json::to_string(&local)?;
    self
      .repository
      .write(&storage_key(&local.record.local_id), &json)
      .map_err(SyncError::storage)?;
    debug!(record_id = %local.record.local_id, "local record stored");
    self.lock().insert(local.record.local_id.clone(), local);
    Ok(())
  }

  /// Modify a stored record in place and persist the result. Returns the
  /// updated record, or `None` if it does not exist.
  pub fn update<F>(&self, local_id: &str, f: F) -> Result<Option<LocalRecord>>
  where
    F: FnOnce(&mut LocalRecord),
  {
    let mut records = self.lock();
    let Some(local) = records.get_mut(local_id) else {
      return Ok(None);
    };

    let mut updated = local.clone();
    f(&mut updated);
    let json = serde_json::to_string(&updated)?;
    self
      .repository
      .write(&storage_key(local_id), &json)
      .map_err(SyncError::storage)?;
    *local = updated.clone();
    Ok(Some(updated))
  }

  pub fn remove(&self, local_id: &str) -> Result<Option<LocalRecord>> {
    self
      .repository
      .remove(&storage_key(local_id))
      .map_err(SyncError::storage)?;
    Ok(self.lock().remove(local_id))
  }

  /// Find a record by its remote key (remote id, else local id).
  pub fn find_by_remote_key(&self, key: &str) -> Option<LocalRecord> {
    self
      .lock()
      .values()
      .find(|local| local.record.remote_key() == key)
      .cloned()
  }

  /// Every record, ordered by local id.
  pub fn all(&self) -> Vec<LocalRecord> {
    self.lock().values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<String, LocalRecord>> {
    self.records.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn storage_key(local_id: &str) -> String {
  format!("{}{}", RECORD_KEY_PREFIX, local_id)
}
