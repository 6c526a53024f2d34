//! Sync status tracker: per-record lifecycle state machine.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::events::{StatusChange, StatusEvents};
use crate::model::SyncStatus;

/// Whether `from -> to` is a permitted transition.
///
/// `Synced`/`SyncFailed -> NotSynced` is a new local mutation starting a new
/// lifecycle, not a step of the delivery protocol. `Syncing -> NotSynced`
/// is a record edited while its write was in flight.
pub fn is_allowed(from: SyncStatus, to: SyncStatus) -> bool {
  use SyncStatus::*;
  matches!(
    (from, to),
    (NotSynced, Syncing)
      | (SyncFailed, Syncing)
      | (Syncing, Synced)
      | (Syncing, SyncFailed)
      | (Syncing, Conflict)
      | (Syncing, NotSynced)
      | (Conflict, Synced)
      | (Synced, NotSynced)
      | (SyncFailed, NotSynced)
  )
}

#[derive(Debug, Clone, Copy)]
struct Entry {
  status: SyncStatus,
  last_synced_at: Option<DateTime<Utc>>,
}

/// Tracks the status of every known record and publishes each transition.
pub struct SyncStatusTracker {
  entries: Mutex<HashMap<String, Entry>>,
  events: StatusEvents,
}

impl SyncStatusTracker {
  pub fn new(events: StatusEvents) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      events,
    }
  }

  /// Start tracking a record in the given state. Does not publish.
  pub fn track(&self, record_id: &str, status: SyncStatus, last_synced_at: Option<DateTime<Utc>>) {
    self.lock().insert(
      record_id.to_string(),
      Entry {
        status,
        last_synced_at,
      },
    );
  }

  pub fn forget(&self, record_id: &str) {
    self.lock().remove(record_id);
  }

  /// Current status; untracked records are `NotSynced`.
  pub fn status(&self, record_id: &str) -> SyncStatus {
    self
      .lock()
      .get(record_id)
      .map(|e| e.status)
      .unwrap_or_default()
  }

  pub fn last_synced_at(&self, record_id: &str) -> Option<DateTime<Utc>> {
    self.lock().get(record_id).and_then(|e| e.last_synced_at)
  }

  pub fn is_tracked(&self, record_id: &str) -> bool {
    self.lock().contains_key(record_id)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Move a record to `to`. Disallowed transitions and untracked records
  /// change nothing and return `false`. Entering `Synced` stamps the
  /// last-synced time.
  pub fn transition(&self, record_id: &str, to: SyncStatus) -> bool {
    let from = {
      let mut entries = self.lock();
      let Some(entry) = entries.get_mut(record_id) else {
        debug!(record_id, %to, "transition for untracked record ignored");
        return false;
      };
      let from = entry.status;
      if !is_allowed(from, to) {
        warn!(record_id, %from, %to, "rejected status transition");
        return false;
      }
      entry.status = to;
      if to == SyncStatus::Synced {
        entry.last_synced_at = Some(Utc::now());
      }
      from
    };

    debug!(record_id, %from, %to, "status transition");
    self.events.publish(StatusChange {
      record_id: record_id.to_string(),
      from,
      to,
    });
    true
  }

  /// Ids of records currently in `status`, sorted.
  pub fn records_with_status(&self, status: SyncStatus) -> Vec<String> {
    let mut ids: Vec<String> = self
      .lock()
      .iter()
      .filter(|(_, e)| e.status == status)
      .map(|(id, _)| id.clone())
      .collect();
    ids.sort();
    ids
  }

  pub fn events(&self) -> &StatusEvents {
    &self.events
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}
