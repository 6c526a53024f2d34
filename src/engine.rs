//! Sync engine.
//!
//! Owns one user's session: local records, the cache, the operation queue,
//! status tracking and conflict resolution. Writes pass the validation gate,
//! land locally, and are delivered to the remote store by `sync_pending`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheManager, CacheResult, KeyValueRepository};
use crate::conflict::{is_conflict, ConflictResolver, ConflictStrategy, Resolution};
use crate::error::{Result, SyncError};
use crate::events::{StatusEvents, Subscription};
use crate::model::{EmotionRecord, SyncStatus, UserProfile};
use crate::queue::{
  operation_id, BatchExecutor, FanOutOperation, OperationIntent, OperationQueue, PendingOperation,
  RetryPolicy,
};
use crate::records::{LocalRecord, RecordStore};
use crate::remote::{
  profile_path, record_path, records_root, type_index_path, validate_path, RemoteStore,
};
use crate::status::SyncStatusTracker;
use crate::validation::Validate;

/// Cache key of the signed-in user's profile.
pub const PROFILE_CACHE_KEY: &str = "profile";

/// Repository key of the newest record timestamp seen by `pull_remote`.
const PULL_CURSOR_KEY: &str = "pull_cursor";

const RESOLVE_PRIORITY: i32 = 10;
const PROFILE_PRIORITY: i32 = 1;

fn record_cache_key(local_id: &str) -> String {
  format!("emotion/{}", local_id)
}

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub default_ttl: chrono::Duration,
  pub retry: RetryPolicy,
  pub max_operations_per_sync: usize,
  /// Upper bound on remote records applied by one `pull_remote`
  pub max_records_per_pull: usize,
  pub conflict_strategy: ConflictStrategy,
  pub cancel_fallback: ConflictStrategy,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      default_ttl: chrono::Duration::hours(24),
      retry: RetryPolicy::default(),
      max_operations_per_sync: 100,
      max_records_per_pull: 100,
      conflict_strategy: ConflictStrategy::ServerWins,
      cancel_fallback: ConflictStrategy::ServerWins,
    }
  }
}

/// What happened to a save request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
  /// Stored locally and queued for delivery
  Queued,
  /// Stored locally; a delivery for it is already pending
  AlreadyQueued,
  /// Identical to the synced version, nothing to do
  Unchanged,
}

/// Result of one `sync_pending` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Operations acknowledged by the remote store
  pub delivered: usize,
  /// Conflicts detected during this pass
  pub conflicts: usize,
  /// Paths whose delivery failed
  pub failed: Vec<String>,
  /// Records edited while in flight and queued again
  pub requeued: usize,
  /// Operations left in the queue afterwards
  pub remaining: usize,
  /// The pass was skipped because the engine is offline
  pub offline: bool,
}

/// Result of `pull_remote`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
  pub added: usize,
  pub refreshed: usize,
  pub unchanged: usize,
  /// Remote records not applied: unreadable, invalid, or pending locally
  pub skipped: usize,
  /// More records are waiting for the next pull
  pub truncated: bool,
}

pub struct SyncEngine {
  user_id: String,
  settings: SyncSettings,
  repository: Arc<dyn KeyValueRepository>,
  remote: Arc<dyn RemoteStore>,
  cache: CacheManager,
  queue: OperationQueue,
  batch: BatchExecutor,
  records: RecordStore,
  tracker: SyncStatusTracker,
  resolver: ConflictResolver,
  online: AtomicBool,
}

impl SyncEngine {
  /// Start a session for `user_id`, restoring local records and pending
  /// operations from `repository`.
  pub fn new(
    settings: SyncSettings,
    repository: Arc<dyn KeyValueRepository>,
    remote: Arc<dyn RemoteStore>,
    user_id: impl Into<String>,
  ) -> Result<Self> {
    let user_id = user_id.into();
    if user_id.contains('/') || !validate_path(&user_id).is_valid() {
      return Err(SyncError::invalid_argument(format!(
        "invalid user id '{}'",
        user_id
      )));
    }

    let queue = OperationQueue::new(repository.clone());
    let records = RecordStore::load(repository.clone())?;
    let tracker = SyncStatusTracker::new(StatusEvents::new());
    for local in records.all() {
      let id = &local.record.local_id;
      let status = match local.record.sync_status {
        // Never acknowledged before the last session ended
        SyncStatus::Syncing => SyncStatus::NotSynced,
        SyncStatus::Conflict if !queue.contains_record(id) => SyncStatus::NotSynced,
        other => other,
      };
      tracker.track(id, status, local.last_synced_at);
    }

    let cache = CacheManager::new(repository.clone()).with_default_ttl(settings.default_ttl);
    let batch = BatchExecutor::new(remote.clone(), settings.retry);
    let resolver = ConflictResolver::new(
      repository.clone(),
      settings.conflict_strategy,
      settings.cancel_fallback,
    );

    info!(
      user_id = %user_id,
      records = records.len(),
      pending = queue.len(),
      "sync engine ready"
    );

    Ok(Self {
      user_id,
      settings,
      repository,
      remote,
      cache,
      queue,
      batch,
      records,
      tracker,
      resolver,
      online: AtomicBool::new(true),
    })
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  pub fn set_online(&self, online: bool) {
    let was = self.online.swap(online, Ordering::SeqCst);
    if was != online {
      info!(online, "connectivity changed");
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  // ---- records ----

  /// Validate and store a record locally, then queue it for delivery.
  ///
  /// Invalid records are rejected before reaching the cache or the queue.
  pub fn save_record(&self, record: EmotionRecord) -> Result<SaveOutcome> {
    record.validate().into_result()?;

    let local_id = record.local_id.clone();
    let existing = self.records.get(&local_id);
    let changed = existing
      .as_ref()
      .map_or(true, |e| !e.record.content_eq(&record));
    let status = self.tracker.status(&local_id);

    if !changed && status == SyncStatus::Synced {
      debug!(record_id = %local_id, "record unchanged since last sync");
      return Ok(SaveOutcome::Unchanged);
    }

    if existing.is_none() {
      self.tracker.track(&local_id, SyncStatus::NotSynced, None);
    } else if changed && matches!(status, SyncStatus::Synced | SyncStatus::SyncFailed) {
      self.tracker.transition(&local_id, SyncStatus::NotSynced);
    }

    let mut record = record;
    record.sync_status = self.tracker.status(&local_id);
    let (last_synced_at, base) = existing.map_or((None, None), |e| (e.last_synced_at, e.base));
    self.records.put(LocalRecord {
      record: record.clone(),
      last_synced_at,
      base,
    })?;
    self.refresh_cached(&record);

    // An edit of a conflicted record is the user's resolution
    if status == SyncStatus::Conflict {
      info!(record_id = %local_id, "conflicted record edited, queuing as resolution");
      return self.enqueue_record(OperationIntent::ResolveConflict, &record, RESOLVE_PRIORITY);
    }
    self.enqueue_record(OperationIntent::WriteRecord, &record, 0)
  }

  /// Remove a record locally and queue its remote deletion. Returns `false`
  /// if the record is unknown.
  pub fn delete_record(&self, local_id: &str) -> Result<bool> {
    let Some(local) = self.records.get(local_id) else {
      return Ok(false);
    };

    let path = record_path(&self.user_id, local.record.remote_key());
    self
      .queue
      .cancel(&operation_id(OperationIntent::WriteRecord, &path));
    self.records.remove(local_id)?;
    self.cache.remove(&record_cache_key(local_id));
    self.tracker.forget(local_id);

    let operation = PendingOperation::new(
      OperationIntent::DeleteRecord,
      path,
      Some(serde_json::to_value(&local.record)?),
      "delete emotion record",
    );
    self.queue.enqueue(operation);
    info!(record_id = local_id, "record deleted locally");
    Ok(true)
  }

  /// Current local version of a record.
  pub fn get_record(&self, local_id: &str) -> Option<EmotionRecord> {
    self
      .cache
      .get(&record_cache_key(local_id), false)
      .or_else(|| self.records.get(local_id).map(|local| local.record))
  }

  pub fn records(&self) -> Vec<EmotionRecord> {
    self.records.all().into_iter().map(|l| l.record).collect()
  }

  pub fn status(&self, local_id: &str) -> SyncStatus {
    self.tracker.status(local_id)
  }

  pub fn records_with_status(&self, status: SyncStatus) -> Vec<EmotionRecord> {
    self
      .tracker
      .records_with_status(status)
      .iter()
      .filter_map(|id| self.records.get(id))
      .map(|local| local.record)
      .collect()
  }

  /// Queue every failed record for another delivery attempt.
  pub fn retry_failed(&self) -> Result<usize> {
    let mut queued = 0;
    for record in self.records_with_status(SyncStatus::SyncFailed) {
      if self.enqueue_record(OperationIntent::WriteRecord, &record, 0)? == SaveOutcome::Queued {
        queued += 1;
      }
    }
    Ok(queued)
  }

  // ---- profile ----

  /// Read the profile through the cache, fetching it when stale.
  pub async fn load_profile(&self, force_refresh: bool) -> Result<CacheResult<UserProfile>> {
    let online = self.is_online();
    let remote = &self.remote;
    let retry = self.settings.retry;
    let path = profile_path(&self.user_id);

    self
      .cache
      .get_or_fetch(
        PROFILE_CACHE_KEY,
        move || async move {
          if !online {
            return Err(SyncError::TransientRemote("offline".to_string()));
          }
          let path = path.as_str();
          let value = retry
            .run("fetch profile", move || async move {
              remote.get(path).await.map_err(SyncError::from)
            })
            .await?
            .ok_or_else(|| SyncError::NotFound(path.to_string()))?;

          let profile: UserProfile = serde_json::from_value(value)?;
          profile.validate().into_result()?;
          Ok(profile)
        },
        None,
        force_refresh,
      )
      .await
  }

  /// Validate the profile, cache it, and queue it for delivery.
  pub fn save_profile(&self, profile: UserProfile) -> Result<SaveOutcome> {
    profile.validate().into_result()?;
    self.cache.set(PROFILE_CACHE_KEY, &profile, None)?;

    let operation = PendingOperation::new(
      OperationIntent::WriteProfile,
      profile_path(&self.user_id),
      Some(serde_json::to_value(&profile)?),
      "save user profile",
    )
    .with_priority(PROFILE_PRIORITY);

    Ok(if self.queue.enqueue(operation) {
      SaveOutcome::Queued
    } else {
      SaveOutcome::AlreadyQueued
    })
  }

  // ---- delivery ----

  /// Deliver pending operations, at most `max_operations_per_sync` of them.
  /// Does nothing while offline.
  pub async fn sync_pending(&self) -> SyncReport {
    let mut report = SyncReport::default();
    if !self.is_online() {
      report.offline = true;
      report.remaining = self.queue.len();
      debug!(pending = report.remaining, "offline, sync skipped");
      return report;
    }

    // Operations that cannot progress this pass, released at the end
    let mut deferred = Vec::new();
    for _ in 0..self.settings.max_operations_per_sync {
      let Some(operation) = self.queue.next_ready() else {
        break;
      };
      match operation.intent {
        OperationIntent::WriteRecord | OperationIntent::ResolveConflict => {
          self
            .deliver_record(operation, &mut report, &mut deferred)
            .await
        }
        OperationIntent::DeleteRecord => self.deliver_delete(operation, &mut report).await,
        OperationIntent::WriteProfile => self.deliver_profile(operation, &mut report).await,
      }
    }

    for operation_id in deferred {
      self.queue.release(&operation_id);
    }
    report.remaining = self.queue.len();

    info!(
      delivered = report.delivered,
      conflicts = report.conflicts,
      failed = report.failed.len(),
      remaining = report.remaining,
      "sync pass finished"
    );
    report
  }

  /// Bring remote records into the local store. Records pending locally are
  /// left for the queue drain.
  ///
  /// Pulls are incremental: only records at or after the newest timestamp
  /// seen by the previous pull are considered, oldest first, at most
  /// `max_records_per_pull` of them.
  pub async fn pull_remote(&self) -> Result<PullReport> {
    if !self.is_online() {
      return Err(SyncError::TransientRemote("offline".to_string()));
    }

    let root = records_root(&self.user_id);
    let remote = &self.remote;
    let path = root.as_str();
    let value = self
      .settings
      .retry
      .run("pull records", move || async move {
        remote.get(path).await.map_err(SyncError::from)
      })
      .await?;

    let mut report = PullReport::default();
    let Some(Value::Object(entries)) = value else {
      return Ok(report);
    };

    let cursor = self.pull_cursor();
    let mut candidates = Vec::new();
    for (key, value) in entries {
      let record: EmotionRecord = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(e) => {
          warn!(key = %key, error = %e, "skipping unreadable remote record");
          report.skipped += 1;
          continue;
        }
      };
      if cursor.map_or(true, |cursor| record.timestamp >= cursor) {
        candidates.push((key, record));
      }
    }

    candidates.sort_by_key(|(_, record)| record.timestamp);
    if candidates.len() > self.settings.max_records_per_pull {
      candidates.truncate(self.settings.max_records_per_pull);
      report.truncated = true;
    }
    let newest = candidates.last().map(|(_, record)| record.timestamp);

    let now = Utc::now();
    for (key, mut record) in candidates {
      if record.id.is_none() && key != record.local_id {
        record.id = Some(key.clone());
      }
      let validation = record.validate();
      if !validation.is_valid() {
        warn!(key = %key, %validation, "skipping invalid remote record");
        report.skipped += 1;
        continue;
      }

      let existing = self
        .records
        .get(&record.local_id)
        .or_else(|| self.records.find_by_remote_key(&key));
      record.sync_status = SyncStatus::Synced;

      match existing {
        None => {
          self.store_synced(record, now)?;
          report.added += 1;
        }
        Some(local) if self.tracker.status(&local.record.local_id) == SyncStatus::Synced => {
          record.local_id = local.record.local_id.clone();
          if local.record.content_eq(&record) {
            report.unchanged += 1;
          } else {
            self.store_synced(record, now)?;
            report.refreshed += 1;
          }
        }
        Some(_) => report.skipped += 1,
      }
    }

    if let Some(newest) = newest {
      self.set_pull_cursor(newest)?;
    }

    info!(
      added = report.added,
      refreshed = report.refreshed,
      skipped = report.skipped,
      truncated = report.truncated,
      "pulled remote records"
    );
    Ok(report)
  }

  /// Make the next `pull_remote` consider the whole remote collection.
  pub fn reset_pull_cursor(&self) -> Result<()> {
    self
      .repository
      .remove(PULL_CURSOR_KEY)
      .map_err(SyncError::storage)
  }

  fn pull_cursor(&self) -> Option<DateTime<Utc>> {
    let raw = match self.repository.read(PULL_CURSOR_KEY) {
      Ok(raw) => raw?,
      Err(e) => {
        error!(error = %e, "failed to read pull cursor");
        return None;
      }
    };
    match DateTime::parse_from_rfc3339(&raw) {
      Ok(cursor) => Some(cursor.with_timezone(&Utc)),
      Err(e) => {
        warn!(error = %e, "ignoring unreadable pull cursor");
        None
      }
    }
  }

  fn set_pull_cursor(&self, cursor: DateTime<Utc>) -> Result<()> {
    self
      .repository
      .write(PULL_CURSOR_KEY, &cursor.to_rfc3339())
      .map_err(SyncError::storage)
  }

  // ---- accessors ----

  pub fn pending_operations(&self) -> Vec<PendingOperation> {
    self.queue.pending()
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn resolver(&self) -> &ConflictResolver {
    &self.resolver
  }

  pub fn batch(&self) -> &BatchExecutor {
    &self.batch
  }

  /// Status changes of one record.
  pub fn subscribe(&self, local_id: &str) -> Subscription {
    self.tracker.events().subscribe(local_id)
  }

  /// Status changes of every record.
  pub fn subscribe_all(&self) -> Subscription {
    self.tracker.events().subscribe_all()
  }

  // ---- internals ----

  async fn deliver_record(
    &self,
    operation: PendingOperation,
    report: &mut SyncReport,
    deferred: &mut Vec<String>,
  ) {
    let Some(local_id) = operation.record_id.clone() else {
      warn!(operation_id = %operation.operation_id, "record operation without record id");
      self.queue.abandon(&operation.operation_id);
      return;
    };
    let Some(local) = self.records.get(&local_id) else {
      debug!(record_id = %local_id, "record deleted before delivery");
      self.queue.complete(&operation.operation_id);
      return;
    };

    if operation.intent == OperationIntent::WriteRecord {
      if !self.set_status(&local_id, SyncStatus::Syncing) {
        if self.tracker.status(&local_id) == SyncStatus::Synced {
          self.queue.complete(&operation.operation_id);
        } else {
          deferred.push(operation.operation_id);
        }
        return;
      }

      match self.fetch_conflicting(&local).await {
        Ok(None) => {}
        Ok(Some(remote)) => {
          report.conflicts += 1;
          self.resolve_conflict(&operation, local, remote, report).await;
          return;
        }
        Err(e) => {
          self.fail_delivery(&operation, &local_id, e, report, deferred);
          return;
        }
      }
    }

    match self.write_record(&local.record).await {
      Ok(()) => self.acknowledge(&operation, &local.record, report, deferred),
      Err(e) => self.fail_delivery(&operation, &local_id, e, report, deferred),
    }
  }

  /// Remote version of `local` if it conflicts with the local one.
  async fn fetch_conflicting(&self, local: &LocalRecord) -> Result<Option<EmotionRecord>> {
    let path = record_path(&self.user_id, local.record.remote_key());
    let remote = &self.remote;
    let path_ref = path.as_str();
    let value = self
      .settings
      .retry
      .run("fetch remote record", move || async move {
        remote.get(path_ref).await.map_err(SyncError::from)
      })
      .await?;

    let Some(value) = value else {
      return Ok(None);
    };
    let remote_record: EmotionRecord = match serde_json::from_value(value) {
      Ok(record) => record,
      Err(e) => {
        warn!(path = %path, error = %e, "remote record unreadable, overwriting");
        return Ok(None);
      }
    };

    if is_conflict(&local.record, &remote_record, local.base.as_ref()) {
      Ok(Some(remote_record))
    } else {
      Ok(None)
    }
  }

  /// Mark the record as conflicted, resolve it, and queue the resolution.
  ///
  /// A resolution that fails validation is not delivered: the record stays in
  /// `Conflict` until the user saves a valid version.
  async fn resolve_conflict(
    &self,
    operation: &PendingOperation,
    local: LocalRecord,
    remote: EmotionRecord,
    report: &mut SyncReport,
  ) {
    let local_id = local.record.local_id.clone();
    self.set_status(&local_id, SyncStatus::Conflict);
    info!(record_id = %local_id, "conflict detected");

    let strategy = self.resolver.preferred_strategy();
    let Resolution {
      record: mut resolved,
      copy,
    } = match strategy {
      ConflictStrategy::Manual => {
        self
          .resolver
          .resolve_interactively(&local.record, &remote)
          .await
      }
      other => self.resolver.resolve(&local.record, &remote, Some(other)),
    };
    self.queue.complete(&operation.operation_id);

    if self.records.get(&local_id).is_none() {
      debug!(record_id = %local_id, "record deleted while resolving");
      return;
    }

    resolved.local_id = local_id.clone();
    let validation = resolved.validate();
    if !validation.is_valid() {
      warn!(record_id = %local_id, %validation, "resolved record invalid, conflict left open");
      report.failed.push(operation.path.clone());
      return;
    }
    resolved.sync_status = SyncStatus::Conflict;

    if let Err(e) = self.records.put(LocalRecord {
      record: resolved.clone(),
      last_synced_at: local.last_synced_at,
      base: Some(remote),
    }) {
      error!(record_id = %local_id, error = %e, "failed to store resolved record");
    }
    self.refresh_cached(&resolved);

    if let Err(e) =
      self.enqueue_record(OperationIntent::ResolveConflict, &resolved, RESOLVE_PRIORITY)
    {
      error!(record_id = %local_id, error = %e, "failed to queue resolved record");
    }
    if let Some(copy) = copy {
      self.keep_copy(copy);
    }
  }

  /// Store the local side of a `KeepBoth` resolution as a new record.
  fn keep_copy(&self, copy: EmotionRecord) {
    let copy_id = copy.local_id.clone();
    self.tracker.track(&copy_id, SyncStatus::NotSynced, None);
    if let Err(e) = self.records.put(LocalRecord::unsynced(copy.clone())) {
      error!(record_id = %copy_id, error = %e, "failed to store kept copy");
      self.tracker.forget(&copy_id);
      return;
    }
    self.refresh_cached(&copy);
    match self.enqueue_record(OperationIntent::WriteRecord, &copy, 0) {
      Ok(_) => info!(record_id = %copy_id, "local version kept as a new record"),
      Err(e) => error!(record_id = %copy_id, error = %e, "failed to queue kept copy"),
    }
  }

  /// Write the record and its type index as one fan-out.
  async fn write_record(&self, record: &EmotionRecord) -> Result<()> {
    let key = record.remote_key();
    let mut remote_copy = record.clone();
    remote_copy.sync_status = SyncStatus::Synced;

    let legs = [
      FanOutOperation::set(
        record_path(&self.user_id, key),
        serde_json::to_value(&remote_copy)?,
      )
      .with_description("emotion record"),
      FanOutOperation::set(
        type_index_path(&self.user_id, &record.emotion_type, key),
        Value::Bool(true),
      )
      .with_description("type index"),
    ];
    self.batch.execute_fan_out(&legs).await.map(|_| ())
  }

  /// Record a delivered write. A record edited while in flight is queued
  /// again instead of being marked `Synced`.
  fn acknowledge(
    &self,
    operation: &PendingOperation,
    delivered: &EmotionRecord,
    report: &mut SyncReport,
    deferred: &mut Vec<String>,
  ) {
    self.queue.complete(&operation.operation_id);
    report.delivered += 1;

    let local_id = &delivered.local_id;
    let Some(current) = self.records.get(local_id) else {
      debug!(record_id = %local_id, "record deleted while in flight");
      return;
    };
    if current.record.content_eq(delivered) {
      self.set_status(local_id, SyncStatus::Synced);
      return;
    }

    info!(record_id = %local_id, "record changed during delivery, queuing again");
    if let Err(e) = self
      .records
      .update(local_id, |local| local.base = Some(delivered.clone()))
    {
      error!(record_id = %local_id, error = %e, "failed to store delivered version");
    }

    // A resolution stays in conflict until its latest version is acknowledged
    let (intent, priority) = match operation.intent {
      OperationIntent::ResolveConflict => (OperationIntent::ResolveConflict, RESOLVE_PRIORITY),
      _ => {
        self.set_status(local_id, SyncStatus::NotSynced);
        (OperationIntent::WriteRecord, 0)
      }
    };
    match self.enqueue_record(intent, &current.record, priority) {
      Ok(_) => {
        report.requeued += 1;
        // Next pass
        let requeued = operation_id(
          intent,
          &record_path(&self.user_id, current.record.remote_key()),
        );
        self.queue.hold(&requeued);
        deferred.push(requeued);
      }
      Err(e) => error!(record_id = %local_id, error = %e, "failed to queue edited record"),
    }
  }

  fn fail_delivery(
    &self,
    operation: &PendingOperation,
    local_id: &str,
    err: SyncError,
    report: &mut SyncReport,
    deferred: &mut Vec<String>,
  ) {
    report.failed.push(operation.path.clone());

    if operation.intent == OperationIntent::ResolveConflict {
      // Conflict only ends once the resolution is acknowledged
      warn!(record_id = local_id, error = %err, "resolution not delivered, will retry");
      deferred.push(operation.operation_id.clone());
      return;
    }

    error!(
      operation_id = %operation.operation_id,
      record_id = local_id,
      error = %err,
      "delivery failed"
    );
    self.queue.abandon(&operation.operation_id);
    self.set_status(local_id, SyncStatus::SyncFailed);
  }

  async fn deliver_delete(&self, operation: PendingOperation, report: &mut SyncReport) {
    let mut legs = vec![FanOutOperation::delete(operation.path.clone())];
    let deleted = operation
      .payload
      .clone()
      .and_then(|value| serde_json::from_value::<EmotionRecord>(value).ok());
    if let Some(record) = deleted {
      legs.push(FanOutOperation::delete(type_index_path(
        &self.user_id,
        &record.emotion_type,
        record.remote_key(),
      )));
    }

    match self.batch.execute_fan_out(&legs).await {
      Ok(_) => {
        self.queue.complete(&operation.operation_id);
        report.delivered += 1;
      }
      Err(e) => {
        error!(path = %operation.path, error = %e, "remote delete failed");
        self.queue.abandon(&operation.operation_id);
        report.failed.push(operation.path);
      }
    }
  }

  async fn deliver_profile(&self, operation: PendingOperation, report: &mut SyncReport) {
    let profile = self
      .cache
      .get::<UserProfile>(PROFILE_CACHE_KEY, true)
      .or_else(|| {
        operation
          .payload
          .clone()
          .and_then(|value| serde_json::from_value(value).ok())
      });
    let Some(profile) = profile else {
      warn!("no profile to deliver");
      self.queue.abandon(&operation.operation_id);
      return;
    };

    let value = match serde_json::to_value(&profile) {
      Ok(value) => value,
      Err(e) => {
        error!(error = %e, "failed to serialize profile");
        self.queue.abandon(&operation.operation_id);
        report.failed.push(operation.path);
        return;
      }
    };

    let remote = &self.remote;
    let path = operation.path.as_str();
    let result = self
      .settings
      .retry
      .run("write profile", move || {
        let value = value.clone();
        async move { remote.set(path, value).await.map_err(SyncError::from) }
      })
      .await;

    match result {
      Ok(()) => {
        self.queue.complete(&operation.operation_id);
        report.delivered += 1;
        let current = self.cache.get::<UserProfile>(PROFILE_CACHE_KEY, true);
        if let Some(current) = current.filter(|c| *c != profile) {
          if let Err(e) = self.save_profile(current) {
            error!(error = %e, "failed to queue edited profile");
          } else {
            report.requeued += 1;
          }
        }
      }
      Err(e) => {
        error!(error = %e, "profile delivery failed");
        self.queue.abandon(&operation.operation_id);
        report.failed.push(operation.path);
      }
    }
  }

  fn enqueue_record(
    &self,
    intent: OperationIntent,
    record: &EmotionRecord,
    priority: i32,
  ) -> Result<SaveOutcome> {
    let operation = PendingOperation::new(
      intent,
      record_path(&self.user_id, record.remote_key()),
      Some(serde_json::to_value(record)?),
      format!("{} {}", intent, record.emotion_type),
    )
    .with_priority(priority)
    .for_record(record.local_id.clone());

    Ok(if self.queue.enqueue(operation) {
      SaveOutcome::Queued
    } else {
      SaveOutcome::AlreadyQueued
    })
  }

  /// Transition the tracker and mirror the new status into the store and cache.
  fn set_status(&self, local_id: &str, to: SyncStatus) -> bool {
    if !self.tracker.transition(local_id, to) {
      return false;
    }

    let last_synced_at = self.tracker.last_synced_at(local_id);
    match self.records.update(local_id, |local| {
      local.record.sync_status = to;
      local.last_synced_at = last_synced_at;
      if to == SyncStatus::Synced {
        local.base = Some(local.record.clone());
      }
    }) {
      Ok(Some(local)) => self.refresh_cached(&local.record),
      Ok(None) => {}
      Err(e) => error!(record_id = local_id, error = %e, "failed to persist sync status"),
    }
    true
  }

  fn store_synced(&self, record: EmotionRecord, synced_at: chrono::DateTime<Utc>) -> Result<()> {
    self
      .tracker
      .track(&record.local_id, SyncStatus::Synced, Some(synced_at));
    self.refresh_cached(&record);
    self.records.put(LocalRecord {
      base: Some(record.clone()),
      record,
      last_synced_at: Some(synced_at),
    })
  }

  fn refresh_cached(&self, record: &EmotionRecord) {
    if let Err(e) = self
      .cache
      .set(&record_cache_key(&record.local_id), record, None)
    {
      warn!(record_id = %record.local_id, error = %e, "failed to cache record");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryRepository};
  use crate::conflict::{ConflictChoice, ConflictDecision};
  use crate::error::RemoteError;
  use crate::model::EmotionType;
  use crate::remote::{MemoryRemoteStore, UpdateMap};
  use async_trait::async_trait;
  use chrono::Duration;
  use serde_json::json;
  use tokio::sync::Notify;

  const USER: &str = "user-1";

  fn settings() -> SyncSettings {
    SyncSettings {
      retry: RetryPolicy::immediate(2),
      ..SyncSettings::default()
    }
  }

  fn engine_with(
    settings: SyncSettings,
  ) -> (Arc<MemoryRepository>, Arc<MemoryRemoteStore>, SyncEngine) {
    let repo = Arc::new(MemoryRepository::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let engine = SyncEngine::new(settings, repo.clone(), remote.clone(), USER).unwrap();
    (repo, remote, engine)
  }

  fn engine() -> (Arc<MemoryRemoteStore>, SyncEngine) {
    let (_, remote, engine) = engine_with(settings());
    (remote, engine)
  }

  fn record(note: &str) -> EmotionRecord {
    let mut record = EmotionRecord::new(EmotionType::Joy, 0.6, 0.7, "#FFD700").with_note(note);
    record.timestamp = Utc::now() - Duration::hours(2);
    record
  }

  /// Local record "A" at T1 and a remote version "B" at T2 > T1 already
  /// stored at the record path.
  fn diverged(remote_store: &MemoryRemoteStore) -> (EmotionRecord, EmotionRecord) {
    let local = record("A");
    let mut remote = local.clone();
    remote.note = Some("B".to_string());
    remote.intensity = 0.2;
    remote.color_hex = "#0000FF".to_string();
    remote.timestamp = local.timestamp + Duration::minutes(30);
    remote_store.insert(
      &record_path(USER, &local.local_id),
      serde_json::to_value(&remote).unwrap(),
    );
    (local, remote)
  }

  #[tokio::test]
  async fn test_invalid_record_never_reaches_cache_or_queue() {
    let (remote, engine) = engine();
    let mut bad = record("x");
    bad.intensity = 1.5;

    let err = engine.save_record(bad.clone()).unwrap_err();

    assert!(err.validation().unwrap().has_code("ERR_INVALID_INTENSITY"));
    assert!(engine.pending_operations().is_empty());
    assert!(engine.get_record(&bad.local_id).is_none());
    assert_eq!(engine.cache().memory_len(), 0);
    engine.sync_pending().await;
    assert_eq!(remote.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_save_and_sync_writes_record_and_index() {
    let (remote, engine) = engine();
    let r = record("first");
    let id = r.local_id.clone();

    assert_eq!(engine.save_record(r).unwrap(), SaveOutcome::Queued);
    assert_eq!(engine.status(&id), SyncStatus::NotSynced);

    let report = engine.sync_pending().await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(engine.status(&id), SyncStatus::Synced);
    assert_eq!(engine.get_record(&id).unwrap().sync_status, SyncStatus::Synced);
    assert_eq!(remote.update_calls(), 1);
    assert_eq!(
      remote.value_at(&format!("users/{}/emotionHistory/{}/note", USER, id)),
      Some(json!("first"))
    );
    assert_eq!(
      remote.value_at(&type_index_path(USER, "Joy", &id)),
      Some(json!(true))
    );
  }

  #[tokio::test]
  async fn test_resaving_synced_record_is_idempotent() {
    let (_, engine) = engine();
    let r = record("same");
    engine.save_record(r.clone()).unwrap();
    engine.sync_pending().await;

    assert_eq!(engine.save_record(r.clone()).unwrap(), SaveOutcome::Unchanged);
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
    assert!(engine.pending_operations().is_empty());
  }

  #[tokio::test]
  async fn test_duplicate_saves_share_one_operation() {
    let (_, engine) = engine();
    let r = record("one");
    assert_eq!(engine.save_record(r.clone()).unwrap(), SaveOutcome::Queued);
    assert_eq!(
      engine.save_record(r.clone().with_note("two")).unwrap(),
      SaveOutcome::AlreadyQueued
    );
    assert_eq!(engine.pending_operations().len(), 1);

    engine.sync_pending().await;
    assert_eq!(engine.get_record(&r.local_id).unwrap().note.as_deref(), Some("two"));
  }

  #[tokio::test]
  async fn test_local_edit_of_synced_record_starts_new_lifecycle() {
    let (_, engine) = engine();
    let r = record("v1");
    engine.save_record(r.clone()).unwrap();
    engine.sync_pending().await;

    let mut sub = engine.subscribe(&r.local_id);
    assert_eq!(engine.save_record(r.clone().with_note("v2")).unwrap(), SaveOutcome::Queued);
    assert_eq!(engine.status(&r.local_id), SyncStatus::NotSynced);
    assert_eq!(sub.try_recv().unwrap().to, SyncStatus::NotSynced);

    // Remote still holds the acknowledged version
    let report = engine.sync_pending().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_edits_on_both_sides_of_synced_record_conflict() {
    let (remote, engine) = engine();
    let r = record("orig");
    engine.save_record(r.clone()).unwrap();
    engine.sync_pending().await;

    // Another device edits the synced record
    let mut theirs = r.clone().with_note("remote edit");
    theirs.timestamp = Utc::now();
    let path = record_path(USER, &r.local_id);
    remote.insert(&path, serde_json::to_value(&theirs).unwrap());
    engine.save_record(r.clone().with_note("local edit")).unwrap();

    let report = engine.sync_pending().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(
      remote.value_at(&format!("{}/note", path)),
      Some(json!("remote edit"))
    );
    assert!(engine.get_record(&r.local_id).unwrap().content_eq(&theirs));
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_offline_keeps_operations_queued() {
    let (remote, engine) = engine();
    engine.set_online(false);
    engine.save_record(record("offline")).unwrap();

    let report = engine.sync_pending().await;
    assert!(report.offline);
    assert_eq!(report.remaining, 1);
    assert_eq!(remote.total_calls(), 0);

    engine.set_online(true);
    assert_eq!(engine.sync_pending().await.delivered, 1);
  }

  #[tokio::test]
  async fn test_sync_is_limited_per_pass() {
    let (_, _, engine) = engine_with(SyncSettings {
      max_operations_per_sync: 2,
      ..settings()
    });
    for i in 0..3 {
      engine.save_record(record(&format!("r{}", i))).unwrap();
    }

    let report = engine.sync_pending().await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.remaining, 1);
  }

  #[tokio::test]
  async fn test_merge_conflict_ends_synced() {
    let (_, remote_store, engine) = engine_with(SyncSettings {
      conflict_strategy: ConflictStrategy::Merge,
      ..settings()
    });
    let (local, remote) = diverged(&remote_store);
    let mut events = engine.subscribe(&local.local_id);
    engine.save_record(local.clone()).unwrap();

    let report = engine.sync_pending().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.delivered, 1);
    let merged = engine.get_record(&local.local_id).unwrap();
    let note = merged.note.clone().unwrap();
    assert!(note.contains("[local] A") && note.contains("[remote] B"));
    assert_eq!(merged.intensity, remote.intensity);
    assert_eq!(merged.color_hex, remote.color_hex);
    assert_eq!(merged.timestamp, remote.timestamp);
    assert_eq!(merged.sync_status, SyncStatus::Synced);

    let path = record_path(USER, &local.local_id);
    assert_eq!(
      remote_store.value_at(&format!("{}/note", path)),
      Some(json!(note))
    );

    let statuses: Vec<SyncStatus> = events.drain().into_iter().map(|c| c.to).collect();
    assert_eq!(
      statuses,
      vec![SyncStatus::Syncing, SyncStatus::Conflict, SyncStatus::Synced]
    );
  }

  #[tokio::test]
  async fn test_merge_of_long_notes_keeps_both_sides() {
    let (_, remote_store, engine) = engine_with(SyncSettings {
      conflict_strategy: ConflictStrategy::Merge,
      ..settings()
    });
    let local = record(&"a".repeat(300));
    let remote = local.clone().with_note("b".repeat(300));
    remote_store.insert(
      &record_path(USER, &local.local_id),
      serde_json::to_value(&remote).unwrap(),
    );
    engine.save_record(local.clone()).unwrap();

    let report = engine.sync_pending().await;

    assert_eq!(report.conflicts, 1);
    let merged = engine.get_record(&local.local_id).unwrap();
    assert_eq!(merged.sync_status, SyncStatus::Synced);
    let note = merged.note.unwrap();
    assert!(note.starts_with("[local] aaa"));
    assert!(note.contains("[remote] bbb"));
  }

  #[tokio::test]
  async fn test_invalid_resolution_leaves_conflict_open() {
    let (_, remote_store, engine) = engine_with(SyncSettings {
      conflict_strategy: ConflictStrategy::Manual,
      ..settings()
    });
    let mut prompts = engine.resolver().connect_ui();
    let (local, _) = diverged(&remote_store);
    let id = local.local_id.clone();
    engine.save_record(local.clone()).unwrap();

    let ui = tokio::spawn(async move {
      let request = prompts.recv().await.unwrap();
      let mut edited = request.local.clone();
      edited.intensity = 2.0;
      request.respond(ConflictDecision::new(ConflictChoice::Custom(edited)));
    });
    let report = engine.sync_pending().await;
    ui.await.unwrap();

    let note_path = format!("{}/note", record_path(USER, &id));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(engine.status(&id), SyncStatus::Conflict);
    assert_eq!(engine.records_with_status(SyncStatus::Conflict).len(), 1);
    assert!(engine.pending_operations().is_empty());
    assert_eq!(remote_store.value_at(&note_path), Some(json!("B")));

    // The user's next save settles it
    assert_eq!(
      engine.save_record(local.with_note("settled")).unwrap(),
      SaveOutcome::Queued
    );
    assert_eq!(
      engine.pending_operations()[0].intent,
      OperationIntent::ResolveConflict
    );
    engine.sync_pending().await;
    assert_eq!(engine.status(&id), SyncStatus::Synced);
    assert_eq!(remote_store.value_at(&note_path), Some(json!("settled")));
  }

  #[tokio::test]
  async fn test_keep_both_queues_local_copy_as_new_record() {
    let (_, remote_store, engine) = engine_with(SyncSettings {
      conflict_strategy: ConflictStrategy::KeepBoth,
      ..settings()
    });
    let (local, remote) = diverged(&remote_store);
    engine.save_record(local.clone()).unwrap();

    let report = engine.sync_pending().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.delivered, 2);
    let kept = engine.get_record(&local.local_id).unwrap();
    assert!(kept.content_eq(&remote));
    assert_eq!(kept.sync_status, SyncStatus::Synced);

    let records = engine.records();
    assert_eq!(records.len(), 2);
    let copy = records
      .iter()
      .find(|r| r.local_id != local.local_id)
      .unwrap();
    assert_eq!(copy.note.as_deref(), Some("A"));
    assert_eq!(engine.status(&copy.local_id), SyncStatus::Synced);
    assert_eq!(
      remote_store.value_at(&format!("{}/note", record_path(USER, &copy.local_id))),
      Some(json!("A"))
    );
  }

  #[tokio::test]
  async fn test_server_wins_conflict_takes_remote_version() {
    let (remote_store, engine) = engine();
    let (local, remote) = diverged(&remote_store);
    engine.save_record(local.clone()).unwrap();

    engine.sync_pending().await;

    let resolved = engine.get_record(&local.local_id).unwrap();
    assert!(resolved.content_eq(&remote));
    assert_eq!(engine.status(&local.local_id), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_manual_conflict_waits_for_ui() {
    let (_, remote_store, engine) = engine_with(SyncSettings {
      conflict_strategy: ConflictStrategy::Manual,
      ..settings()
    });
    let mut prompts = engine.resolver().connect_ui();
    let (local, _) = diverged(&remote_store);
    engine.save_record(local.clone()).unwrap();

    let ui = tokio::spawn(async move {
      let request = prompts.recv().await.unwrap();
      request.respond(ConflictDecision::remembered(ConflictChoice::UseLocal));
    });
    let report = engine.sync_pending().await;
    ui.await.unwrap();

    assert_eq!(report.conflicts, 1);
    let resolved = engine.get_record(&local.local_id).unwrap();
    assert!(resolved.content_eq(&local));
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(
      engine.resolver().preferred_strategy(),
      ConflictStrategy::ClientWins
    );
  }

  #[tokio::test]
  async fn test_identical_remote_is_not_a_conflict() {
    let (remote_store, engine) = engine();
    let r = record("same");
    remote_store.insert(
      &record_path(USER, &r.local_id),
      serde_json::to_value(&r).unwrap(),
    );
    engine.save_record(r.clone()).unwrap();

    let report = engine.sync_pending().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_local_id_must_be_a_single_path_segment() {
    let (remote, engine) = engine();
    let mut r = record("x");
    r.local_id = "abc/def".to_string();

    let err = engine.save_record(r).unwrap_err();

    assert!(err
      .validation()
      .unwrap()
      .has_code("ERR_INVALID_LOCAL_ID_CHARACTER"));
    assert!(engine.pending_operations().is_empty());
    engine.sync_pending().await;
    assert_eq!(remote.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_permanent_failure_marks_sync_failed() {
    let (remote, engine) = engine();
    let r = record("x");
    engine.save_record(r.clone()).unwrap();
    let mut all = engine.subscribe_all();
    remote.fail_next(1, RemoteError::permanent("denied"));

    let report = engine.sync_pending().await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(engine.status(&r.local_id), SyncStatus::SyncFailed);
    assert!(all.drain().iter().any(|c| c.to == SyncStatus::SyncFailed));

    assert_eq!(engine.retry_failed().unwrap(), 1);
    engine.sync_pending().await;
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_transient_failures_are_retried() {
    let (remote, engine) = engine();
    let r = record("x");
    engine.save_record(r.clone()).unwrap();
    // First conflict check fails
    remote.fail_next(1, RemoteError::transient("timeout"));

    let report = engine.sync_pending().await;
    assert!(report.failed.is_empty());
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_exhausted_retries_mark_sync_failed() {
    let (remote, engine) = engine();
    let r = record("x");
    engine.save_record(r.clone()).unwrap();
    remote.fail_next(3, RemoteError::transient("timeout"));

    engine.sync_pending().await;
    assert_eq!(engine.status(&r.local_id), SyncStatus::SyncFailed);
  }

  #[tokio::test]
  async fn test_delete_removes_record_and_index() {
    let (remote, engine) = engine();
    let r = record("x");
    engine.save_record(r.clone()).unwrap();
    engine.sync_pending().await;

    assert!(engine.delete_record(&r.local_id).unwrap());
    assert!(!engine.delete_record("unknown").unwrap());
    assert!(engine.get_record(&r.local_id).is_none());

    engine.sync_pending().await;
    assert_eq!(remote.value_at(&record_path(USER, &r.local_id)), None);
    assert_eq!(remote.value_at(&type_index_path(USER, "Joy", &r.local_id)), None);
  }

  #[tokio::test]
  async fn test_delete_before_delivery_cancels_write() {
    let (remote, engine) = engine();
    let r = record("x");
    engine.save_record(r.clone()).unwrap();
    engine.delete_record(&r.local_id).unwrap();

    let pending = engine.pending_operations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].intent, OperationIntent::DeleteRecord);

    engine.sync_pending().await;
    assert_eq!(remote.get_calls(), 0);
    assert_eq!(remote.update_calls(), 1);
  }

  #[tokio::test]
  async fn test_pull_remote_adds_and_refreshes() {
    let (remote, engine) = engine();
    let known = record("old");
    engine.save_record(known.clone()).unwrap();
    engine.sync_pending().await;

    let mut updated = known.clone();
    updated.note = Some("from another device".to_string());
    remote.insert(
      &record_path(USER, &known.local_id),
      serde_json::to_value(&updated).unwrap(),
    );
    let fresh = record("new");
    remote.insert(
      &record_path(USER, &fresh.local_id),
      serde_json::to_value(&fresh).unwrap(),
    );
    let mut invalid = record("bad");
    invalid.value = 3.0;
    remote.insert(
      &record_path(USER, &invalid.local_id),
      serde_json::to_value(&invalid).unwrap(),
    );

    let report = engine.pull_remote().await.unwrap();

    assert_eq!(report.added, 1);
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(engine.status(&fresh.local_id), SyncStatus::Synced);
    assert_eq!(
      engine.get_record(&known.local_id).unwrap().note.as_deref(),
      Some("from another device")
    );
  }

  #[tokio::test]
  async fn test_pull_leaves_pending_records_alone() {
    let (remote, engine) = engine();
    let local = record("mine");
    engine.save_record(local.clone()).unwrap();
    remote.insert(
      &record_path(USER, &local.local_id),
      serde_json::to_value(local.clone().with_note("theirs")).unwrap(),
    );

    let report = engine.pull_remote().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(engine.get_record(&local.local_id).unwrap().note.as_deref(), Some("mine"));
  }

  fn remote_record(remote: &MemoryRemoteStore, note: &str, hours_ago: i64) -> EmotionRecord {
    let mut r = record(note);
    r.timestamp = Utc::now() - Duration::hours(hours_ago);
    remote.insert(
      &record_path(USER, &r.local_id),
      serde_json::to_value(&r).unwrap(),
    );
    r
  }

  #[tokio::test]
  async fn test_pull_is_incremental_and_capped() {
    let (_, remote, engine) = engine_with(SyncSettings {
      max_records_per_pull: 2,
      ..settings()
    });
    let oldest = remote_record(&remote, "oldest", 3);
    let middle = remote_record(&remote, "middle", 2);
    let newest = remote_record(&remote, "newest", 1);

    let first = engine.pull_remote().await.unwrap();
    assert_eq!(first.added, 2);
    assert!(first.truncated);
    assert!(engine.get_record(&oldest.local_id).is_some());
    assert!(engine.get_record(&middle.local_id).is_some());
    assert!(engine.get_record(&newest.local_id).is_none());

    let second = engine.pull_remote().await.unwrap();
    assert_eq!(second.added, 1);
    assert_eq!(second.unchanged, 1);
    assert!(!second.truncated);

    // Older than the cursor, invisible to incremental pulls
    let late = remote_record(&remote, "late", 5);
    assert_eq!(engine.pull_remote().await.unwrap().added, 0);
    assert!(engine.get_record(&late.local_id).is_none());

    engine.reset_pull_cursor().unwrap();
    let full = engine.pull_remote().await.unwrap();
    assert_eq!(full.added, 1);
    assert_eq!(engine.status(&late.local_id), SyncStatus::Synced);
  }

  #[tokio::test]
  async fn test_profile_round_trip() {
    let (remote, engine) = engine();
    let mut bad = UserProfile::new("not-an-email", "jo");
    assert!(engine.save_profile(bad.clone()).is_err());

    bad.email = "jo@example.com".to_string();
    assert_eq!(engine.save_profile(bad.clone()).unwrap(), SaveOutcome::Queued);
    engine.sync_pending().await;

    assert_eq!(
      remote.value_at(&format!("users/{}/profile/email", USER)),
      Some(json!("jo@example.com"))
    );
    let loaded = engine.load_profile(false).await.unwrap();
    assert_eq!(loaded.source, CacheSource::Memory);
    assert_eq!(loaded.data, bad);
  }

  #[tokio::test]
  async fn test_load_profile_offline_uses_disk() {
    let repo = Arc::new(MemoryRepository::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let profile = UserProfile::new("jo@example.com", "jo");
    remote.insert(&profile_path(USER), serde_json::to_value(&profile).unwrap());

    {
      let engine = SyncEngine::new(settings(), repo.clone(), remote.clone(), USER).unwrap();
      let loaded = engine.load_profile(false).await.unwrap();
      assert_eq!(loaded.source, CacheSource::Network);
    }

    let engine = SyncEngine::new(settings(), repo, remote.clone(), USER).unwrap();
    engine.set_online(false);
    let loaded = engine.load_profile(true).await.unwrap();
    assert_eq!(loaded.source, CacheSource::Disk);
    assert_eq!(loaded.data, profile);
    assert_eq!(remote.get_calls(), 1);
  }

  #[tokio::test]
  async fn test_missing_profile_is_not_found() {
    let (_, engine) = engine();
    let err = engine.load_profile(false).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
  }

  #[tokio::test]
  async fn test_state_survives_restart() {
    let repo = Arc::new(MemoryRepository::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let r = record("persisted");
    {
      let engine = SyncEngine::new(settings(), repo.clone(), remote.clone(), USER).unwrap();
      engine.set_online(false);
      engine.save_record(r.clone()).unwrap();
    }

    let engine = SyncEngine::new(settings(), repo, remote.clone(), USER).unwrap();
    assert_eq!(engine.pending_operations().len(), 1);
    assert_eq!(engine.status(&r.local_id), SyncStatus::NotSynced);

    engine.sync_pending().await;
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
  }

  #[test]
  fn test_invalid_user_id_is_rejected() {
    let repo = Arc::new(MemoryRepository::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    assert!(SyncEngine::new(settings(), repo.clone(), remote.clone(), "").is_err());
    assert!(SyncEngine::new(settings(), repo, remote, "a/b").is_err());
  }

  /// Remote store whose multi-path updates wait for the test to release them.
  struct GatedRemote {
    inner: MemoryRemoteStore,
    started: Notify,
    release: Notify,
  }

  #[async_trait]
  impl RemoteStore for GatedRemote {
    async fn get(&self, path: &str) -> std::result::Result<Option<Value>, RemoteError> {
      self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> std::result::Result<(), RemoteError> {
      self.inner.set(path, value).await
    }

    async fn update_multiple(&self, updates: UpdateMap) -> std::result::Result<(), RemoteError> {
      self.started.notify_one();
      self.release.notified().await;
      self.inner.update_multiple(updates).await
    }
  }

  #[tokio::test]
  async fn test_edit_during_delivery_is_queued_again() {
    let remote = Arc::new(GatedRemote {
      inner: MemoryRemoteStore::new(),
      started: Notify::new(),
      release: Notify::new(),
    });
    let engine = SyncEngine::new(
      settings(),
      Arc::new(MemoryRepository::new()),
      remote.clone(),
      USER,
    )
    .unwrap();
    let r = record("v1");
    engine.save_record(r.clone()).unwrap();
    let mut events = engine.subscribe(&r.local_id);

    let (report, ()) = tokio::join!(engine.sync_pending(), async {
      remote.started.notified().await;
      assert_eq!(
        engine.save_record(r.clone().with_note("v2")).unwrap(),
        SaveOutcome::AlreadyQueued
      );
      remote.release.notify_one();
    });

    assert_eq!(report.requeued, 1);
    assert_eq!(report.remaining, 1);
    assert_eq!(engine.status(&r.local_id), SyncStatus::NotSynced);
    assert_eq!(engine.pending_operations().len(), 1);
    let statuses: Vec<SyncStatus> = events.drain().into_iter().map(|c| c.to).collect();
    assert_eq!(statuses, vec![SyncStatus::Syncing, SyncStatus::NotSynced]);

    remote.release.notify_one();
    let report = engine.sync_pending().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(engine.status(&r.local_id), SyncStatus::Synced);
    let statuses: Vec<SyncStatus> = events.drain().into_iter().map(|c| c.to).collect();
    assert_eq!(statuses, vec![SyncStatus::Syncing, SyncStatus::Synced]);
    assert_eq!(
      remote
        .inner
        .value_at(&format!("{}/note", record_path(USER, &r.local_id))),
      Some(json!("v2"))
    );
  }

  #[tokio::test]
  async fn test_delete_while_in_flight_leaves_no_status_behind() {
    let remote = Arc::new(GatedRemote {
      inner: MemoryRemoteStore::new(),
      started: Notify::new(),
      release: Notify::new(),
    });
    let engine = SyncEngine::new(
      settings(),
      Arc::new(MemoryRepository::new()),
      remote.clone(),
      USER,
    )
    .unwrap();
    let r = record("doomed");
    let id = r.local_id.clone();
    engine.save_record(r).unwrap();

    let (report, ()) = tokio::join!(engine.sync_pending(), async {
      remote.started.notified().await;
      assert!(engine.delete_record(&id).unwrap());
      remote.release.notify_one();
      // The queued delete goes out in the same pass
      remote.started.notified().await;
      remote.release.notify_one();
    });

    assert_eq!(report.delivered, 2);
    assert_eq!(report.remaining, 0);
    assert!(!engine.tracker.is_tracked(&id));
    assert!(engine.tracker.is_empty());
    assert!(engine.records().is_empty());
    assert_eq!(remote.inner.value_at(&record_path(USER, &id)), None);
  }
}
