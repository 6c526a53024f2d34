//! Remote store contract.
//!
//! The engine treats the backing store as an opaque keyed document tree
//! addressed by slash-separated paths.

mod memory;
mod path;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::RemoteError;

pub use memory::MemoryRemoteStore;
pub use path::{
  is_valid_key, normalize_path, profile_path, push_key, record_path, records_root,
  type_index_path, validate_path,
};

/// Multi-path update map. `None` deletes the value at that path.
pub type UpdateMap = BTreeMap<String, Option<Value>>;

/// Operations the sync engine needs from the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Value at `path`, or `None` when nothing is stored there.
  async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError>;

  /// Replace the value at `path`.
  async fn set(&self, path: &str, value: Value) -> Result<(), RemoteError>;

  /// Apply every entry of `updates` as a single multi-path write. Either all
  /// paths change or none do.
  async fn update_multiple(&self, updates: UpdateMap) -> Result<(), RemoteError>;

  /// Delete the value at `path`.
  async fn remove(&self, path: &str) -> Result<(), RemoteError> {
    let mut updates = UpdateMap::new();
    updates.insert(path.to_string(), None);
    self.update_multiple(updates).await
  }
}
