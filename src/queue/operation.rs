use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Logical intent of a pending write. Part of the operation id, so a write
/// and a delete of the same path never deduplicate against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationIntent {
  /// Write a record (record path plus its index legs)
  WriteRecord,
  /// Delete a record and its index legs
  DeleteRecord,
  /// Resubmit the outcome of a conflict resolution
  ResolveConflict,
  /// Write the user profile
  WriteProfile,
}

impl fmt::Display for OperationIntent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::WriteRecord => "write_record",
      Self::DeleteRecord => "delete_record",
      Self::ResolveConflict => "resolve_conflict",
      Self::WriteProfile => "write_profile",
    };
    f.write_str(name)
  }
}

/// Deterministic dedup key for a logical write.
pub fn operation_id(intent: OperationIntent, path: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(format!("{}:{}", intent, path).as_bytes());
  hex::encode(hasher.finalize())
}

/// A remote write waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
  pub operation_id: String,
  pub intent: OperationIntent,
  pub path: String,
  /// Value to write. Deletes carry the last known value so dependent
  /// paths can be removed with it.
  #[serde(default)]
  pub payload: Option<Value>,
  pub priority: i32,
  pub description: String,
  /// Local id of the record this operation delivers, if any
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub record_id: Option<String>,
  /// Enqueue sequence number, assigned by the queue
  #[serde(default)]
  pub seq: u64,
}

impl PendingOperation {
  pub fn new(
    intent: OperationIntent,
    path: impl Into<String>,
    payload: Option<Value>,
    description: impl Into<String>,
  ) -> Self {
    let path = path.into();
    Self {
      operation_id: operation_id(intent, &path),
      intent,
      path,
      payload,
      priority: 0,
      description: description.into(),
      record_id: None,
      seq: 0,
    }
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn for_record(mut self, record_id: impl Into<String>) -> Self {
    self.record_id = Some(record_id.into());
    self
  }
}
