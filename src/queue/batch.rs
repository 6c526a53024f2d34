//! Multi-path writes against the remote store.
//!
//! Every write here reaches the remote store as one `update_multiple` call,
//! so a reader never observes some paths written and others not.
//!
//! `execute_atomic` only covers the write half: reads performed by the
//! builder are not isolated from concurrent writers, and a value read there
//! may be stale by the time the update lands.

use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::remote::{normalize_path, push_key, validate_path, RemoteStore, UpdateMap};
use crate::validation::{Validate, ValidationResult};

/// How a fan-out leg changes its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutKind {
  /// Replace the value at the path
  Set,
  /// Merge the children of an object value into the path
  Update,
  /// Remove the value at the path
  Delete,
  /// Write the value under a newly generated child key
  Push,
}

/// One leg of a fan-out write.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutOperation {
  pub path: String,
  pub value: Option<Value>,
  pub kind: FanOutKind,
  pub description: String,
}

impl FanOutOperation {
  pub fn set(path: impl Into<String>, value: Value) -> Self {
    Self::new(path, Some(value), FanOutKind::Set)
  }

  pub fn update(path: impl Into<String>, value: Value) -> Self {
    Self::new(path, Some(value), FanOutKind::Update)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(path, None, FanOutKind::Delete)
  }

  pub fn push(path: impl Into<String>, value: Value) -> Self {
    Self::new(path, Some(value), FanOutKind::Push)
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  fn new(path: impl Into<String>, value: Option<Value>, kind: FanOutKind) -> Self {
    Self {
      path: path.into(),
      value,
      kind,
      description: String::new(),
    }
  }

  /// Add this leg's entries to `updates`, returning the paths it touches.
  fn apply_to(&self, updates: &mut UpdateMap) -> Vec<String> {
    let path = normalize_path(&self.path);
    match (self.kind, &self.value) {
      (FanOutKind::Delete, _) => {
        updates.insert(path.clone(), None);
        vec![path]
      }
      (FanOutKind::Push, value) => {
        let child = format!("{}/{}", path, push_key());
        updates.insert(child.clone(), value.clone());
        vec![child]
      }
      (FanOutKind::Update, Some(Value::Object(fields))) => fields
        .iter()
        .map(|(field, value)| {
          let child = format!("{}/{}", path, field);
          updates.insert(child.clone(), Some(value.clone()));
          child
        })
        .collect(),
      (_, value) => {
        updates.insert(path.clone(), value.clone());
        vec![path]
      }
    }
  }
}

impl Validate for FanOutOperation {
  fn validate(&self) -> ValidationResult {
    let mut result = validate_path(&self.path);

    let needs_value = matches!(
      self.kind,
      FanOutKind::Set | FanOutKind::Update | FanOutKind::Push
    );
    if needs_value && matches!(self.value, None | Some(Value::Null)) {
      result.add_error(
        "value",
        format!("{:?} requires a value", self.kind),
        "ERR_MISSING_VALUE",
      );
    }

    if let (FanOutKind::Update, Some(Value::Object(fields))) = (self.kind, &self.value) {
      for field in fields.keys() {
        result.merge_prefixed("value", validate_path(field));
      }
    }

    result
  }
}

/// Submits batched writes to the remote store with retries.
pub struct BatchExecutor {
  remote: Arc<dyn RemoteStore>,
  retry: RetryPolicy,
}

impl BatchExecutor {
  pub fn new(remote: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
    Self { remote, retry }
  }

  pub fn remote(&self) -> &Arc<dyn RemoteStore> {
    &self.remote
  }

  /// Submit a prepared update map as one network call. An empty map is a
  /// successful no-op.
  pub async fn update_multiple_records(&self, updates: UpdateMap) -> Result<()> {
    if updates.is_empty() {
      debug!("empty update, nothing to submit");
      return Ok(());
    }
    check_update_paths(&updates)?;
    self.submit("update_multiple_records", updates).await
  }

  /// Delete every path in one network call.
  pub async fn delete_multiple_records(&self, paths: &[String]) -> Result<()> {
    let updates = paths
      .iter()
      .map(|path| (normalize_path(path), None))
      .collect();
    self.update_multiple_records(updates).await
  }

  /// Read several paths concurrently. A path whose read fails maps to `None`.
  pub async fn get_multiple_records(&self, paths: &[String]) -> BTreeMap<String, Option<Value>> {
    let reads = paths.iter().map(|path| {
      let remote = self.remote.clone();
      async move {
        let value = match remote.get(path).await {
          Ok(value) => value,
          Err(e) => {
            warn!(path = %path, error = %e, "read failed in batch get");
            None
          }
        };
        (path.clone(), value)
      }
    });

    join_all(reads).await.into_iter().collect()
  }

  /// Validate every leg, then write them all as one multi-path update.
  /// Returns the paths written, with generated keys for `Push` legs. If any
  /// leg is invalid nothing is submitted.
  pub async fn execute_fan_out(&self, operations: &[FanOutOperation]) -> Result<Vec<String>> {
    if operations.is_empty() {
      return Ok(Vec::new());
    }

    let mut report = ValidationResult::new();
    for (index, operation) in operations.iter().enumerate() {
      report.merge_prefixed(&format!("operations[{}]", index), operation.validate());
    }
    if !report.is_valid() {
      warn!(legs = operations.len(), %report, "fan-out rejected before submission");
      return Err(SyncError::Validation(report));
    }

    let mut updates = UpdateMap::new();
    let mut written = Vec::new();
    for operation in operations {
      written.extend(operation.apply_to(&mut updates));
    }

    self.submit("fan_out", updates).await?;
    info!(legs = operations.len(), paths = written.len(), "fan-out applied");
    Ok(written)
  }

  /// Let `builder` read from the remote store and fill an update map, then
  /// submit it as one call. A builder error means nothing is written.
  pub async fn execute_atomic<F, Fut>(&self, builder: F) -> Result<()>
  where
    F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
    Fut: Future<Output = Result<UpdateMap>>,
  {
    let updates = match builder(self.remote.clone()).await {
      Ok(updates) => updates,
      Err(e) => {
        warn!(error = %e, "atomic builder failed, nothing written");
        return Err(e);
      }
    };
    self.update_multiple_records(updates).await
  }

  async fn submit(&self, what: &str, updates: UpdateMap) -> Result<()> {
    self
      .retry
      .run(what, || {
        let updates = updates.clone();
        async move {
          self
            .remote
            .update_multiple(updates)
            .await
            .map_err(SyncError::from)
        }
      })
      .await
  }
}

fn check_update_paths(updates: &UpdateMap) -> Result<()> {
  let mut report = ValidationResult::new();
  for path in updates.keys() {
    report.merge_prefixed(&format!("updates[{}]", path), validate_path(path));
  }
  report.into_result().map_err(SyncError::Validation)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::RemoteError;
  use crate::remote::MemoryRemoteStore;
  use serde_json::json;

  fn executor() -> (Arc<MemoryRemoteStore>, BatchExecutor) {
    let remote = Arc::new(MemoryRemoteStore::new());
    let executor = BatchExecutor::new(remote.clone(), RetryPolicy::immediate(2));
    (remote, executor)
  }

  #[tokio::test]
  async fn test_update_multiple_records_is_one_call() {
    let (remote, executor) = executor();
    let updates: UpdateMap = (0..5)
      .map(|i| (format!("users/u/emotionHistory/r{}", i), Some(json!(i))))
      .collect();

    executor.update_multiple_records(updates).await.unwrap();

    assert_eq!(remote.update_calls(), 1);
    assert_eq!(remote.value_at("users/u/emotionHistory/r4"), Some(json!(4)));
  }

  #[tokio::test]
  async fn test_empty_batches_make_no_calls() {
    let (remote, executor) = executor();
    executor.update_multiple_records(UpdateMap::new()).await.unwrap();
    executor.delete_multiple_records(&[]).await.unwrap();
    assert!(executor.execute_fan_out(&[]).await.unwrap().is_empty());
    assert_eq!(remote.total_calls(), 0);
  }

  #[tokio::test]
  async fn test_delete_multiple_records() {
    let (remote, executor) = executor();
    remote.insert("a/1", json!(1));
    remote.insert("a/2", json!(2));

    executor
      .delete_multiple_records(&["a/1".to_string(), "/a/2/".to_string()])
      .await
      .unwrap();

    assert_eq!(remote.value_at("a/1"), None);
    assert_eq!(remote.value_at("a/2"), None);
  }

  #[tokio::test]
  async fn test_get_multiple_records_tolerates_failures() {
    let (remote, executor) = executor();
    remote.insert("a/1", json!("one"));
    remote.fail_next(1, RemoteError::permanent("denied"));

    let paths = vec!["a/bad.path".to_string(), "a/1".to_string(), "a/3".to_string()];
    let values = executor.get_multiple_records(&paths).await;

    assert_eq!(values.len(), 3);
    assert_eq!(values["a/1"], Some(json!("one")));
    assert_eq!(values["a/3"], None);
  }

  #[tokio::test]
  async fn test_fan_out_with_invalid_leg_writes_nothing() {
    let (remote, executor) = executor();
    let operations = vec![
      FanOutOperation::set("users/u/emotionHistory/r1", json!({"note": "x"})),
      FanOutOperation::set("users/u/emotionsByType/Joy/r1", json!(true)),
      FanOutOperation::set("users/u/bad#path", json!(1)),
      FanOutOperation::update("users/u/stats", json!({"count": 1})),
    ];

    let err = executor.execute_fan_out(&operations).await.unwrap_err();

    let report = err.validation().unwrap();
    assert!(report.has_field("operations[2].path"));
    assert_eq!(remote.total_calls(), 0);
    assert_eq!(remote.value_at("users/u/emotionHistory/r1"), None);
  }

  #[tokio::test]
  async fn test_fan_out_applies_every_kind() {
    let (remote, executor) = executor();
    remote.insert("users/u/old", json!(1));
    remote.insert("users/u/stats/keep", json!("kept"));

    let written = executor
      .execute_fan_out(&[
        FanOutOperation::set("users/u/record", json!({"a": 1})),
        FanOutOperation::update("users/u/stats", json!({"count": 2})),
        FanOutOperation::delete("users/u/old"),
        FanOutOperation::push("users/u/log", json!("entry")),
      ])
      .await
      .unwrap();

    assert_eq!(remote.update_calls(), 1);
    assert_eq!(remote.value_at("users/u/record"), Some(json!({"a": 1})));
    assert_eq!(remote.value_at("users/u/stats/count"), Some(json!(2)));
    assert_eq!(remote.value_at("users/u/stats/keep"), Some(json!("kept")));
    assert_eq!(remote.value_at("users/u/old"), None);

    let pushed = written.iter().find(|p| p.starts_with("users/u/log/")).unwrap();
    assert_eq!(remote.value_at(pushed), Some(json!("entry")));
  }

  #[test]
  fn test_set_leg_requires_value() {
    let leg = FanOutOperation::new("users/u/x", Some(Value::Null), FanOutKind::Set);
    assert!(leg.validate().has_code("ERR_MISSING_VALUE"));
    assert!(FanOutOperation::delete("users/u/x").is_valid());
  }

  #[tokio::test]
  async fn test_transient_failures_are_retried() {
    let (remote, executor) = executor();
    remote.fail_next(2, RemoteError::transient("timeout"));

    executor
      .execute_fan_out(&[FanOutOperation::set("a/b", json!(1))])
      .await
      .unwrap();

    assert_eq!(remote.update_calls(), 3);
    assert_eq!(remote.value_at("a/b"), Some(json!(1)));
  }

  #[tokio::test]
  async fn test_atomic_builder_error_writes_nothing() {
    let (remote, executor) = executor();
    remote.insert("users/u/points", json!(10));

    let result = executor
      .execute_atomic(|remote| async move {
        let points = remote.get("users/u/points").await?.and_then(|v| v.as_i64());
        if points.unwrap_or(0) < 50 {
          return Err(SyncError::invalid_argument("not enough points"));
        }
        Ok(UpdateMap::new())
      })
      .await;

    assert!(result.is_err());
    assert_eq!(remote.update_calls(), 0);
  }

  #[tokio::test]
  async fn test_atomic_builder_reads_then_writes() {
    let (remote, executor) = executor();
    remote.insert("users/u/points", json!(10));

    executor
      .execute_atomic(|remote| async move {
        let points = remote
          .get("users/u/points")
          .await?
          .and_then(|v| v.as_i64())
          .unwrap_or(0);
        let mut updates = UpdateMap::new();
        updates.insert("users/u/points".to_string(), Some(json!(points + 5)));
        updates.insert("users/u/history/last".to_string(), Some(json!(5)));
        Ok(updates)
      })
      .await
      .unwrap();

    assert_eq!(remote.value_at("users/u/points"), Some(json!(15)));
    assert_eq!(remote.update_calls(), 1);
  }
}
