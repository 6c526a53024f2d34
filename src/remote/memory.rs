use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{normalize_path, validate_path, RemoteStore, UpdateMap};
use crate::error::RemoteError;

/// Remote store backed by an in-process JSON document tree.
///
/// Failures can be injected for the next calls, and every call kind is
/// counted, so tests can observe batching and retries.
#[derive(Default)]
pub struct MemoryRemoteStore {
  root: Mutex<Value>,
  failures: Mutex<VecDeque<RemoteError>>,
  gets: AtomicUsize,
  sets: AtomicUsize,
  updates: AtomicUsize,
}

impl MemoryRemoteStore {
  pub fn new() -> Self {
    Self {
      root: Mutex::new(Value::Object(Map::new())),
      ..Default::default()
    }
  }

  /// Make the next `count` calls fail with `error`.
  pub fn fail_next(&self, count: usize, error: RemoteError) {
    let mut failures = lock(&self.failures);
    for _ in 0..count {
      failures.push_back(error.clone());
    }
  }

  /// Write a value directly, bypassing failure injection and counters.
  pub fn insert(&self, path: &str, value: Value) {
    write_at(&mut lock(&self.root), path, Some(value));
  }

  /// Read a value directly, bypassing failure injection and counters.
  pub fn value_at(&self, path: &str) -> Option<Value> {
    read_at(&lock(&self.root), path).cloned()
  }

  pub fn get_calls(&self) -> usize {
    self.gets.load(Ordering::SeqCst)
  }

  pub fn set_calls(&self) -> usize {
    self.sets.load(Ordering::SeqCst)
  }

  pub fn update_calls(&self) -> usize {
    self.updates.load(Ordering::SeqCst)
  }

  /// Total calls of any kind that reached the store.
  pub fn total_calls(&self) -> usize {
    self.get_calls() + self.set_calls() + self.update_calls()
  }

  fn injected_failure(&self) -> Result<(), RemoteError> {
    match lock(&self.failures).pop_front() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
  async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError> {
    self.gets.fetch_add(1, Ordering::SeqCst);
    self.injected_failure()?;
    check_path(path)?;
    Ok(read_at(&lock(&self.root), path).cloned())
  }

  async fn set(&self, path: &str, value: Value) -> Result<(), RemoteError> {
    self.sets.fetch_add(1, Ordering::SeqCst);
    self.injected_failure()?;
    check_path(path)?;
    write_at(&mut lock(&self.root), path, Some(value));
    Ok(())
  }

  async fn update_multiple(&self, updates: UpdateMap) -> Result<(), RemoteError> {
    self.updates.fetch_add(1, Ordering::SeqCst);
    self.injected_failure()?;
    for path in updates.keys() {
      check_path(path)?;
    }

    let mut root = lock(&self.root);
    for (path, value) in updates {
      write_at(&mut root, &path, value);
    }
    Ok(())
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn check_path(path: &str) -> Result<(), RemoteError> {
  let result = validate_path(path);
  if result.is_valid() {
    Ok(())
  } else {
    Err(RemoteError::permanent(format!("invalid path: {}", result)))
  }
}

fn read_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
  normalize_path(path)
    .split('/')
    .try_fold(root, |node, segment| node.get(segment))
}

fn write_at(root: &mut Value, path: &str, value: Option<Value>) {
  let normalized = normalize_path(path);
  let segments: Vec<&str> = normalized.split('/').collect();
  let Some((leaf, parents)) = segments.split_last() else {
    return;
  };

  let mut node = root;
  for segment in parents {
    if !node.is_object() {
      *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
      return;
    };
    node = map
      .entry(segment.to_string())
      .or_insert_with(|| Value::Object(Map::new()));
  }

  if !node.is_object() {
    if value.is_none() {
      return;
    }
    *node = Value::Object(Map::new());
  }
  if let Value::Object(map) = node {
    match value {
      Some(value) => {
        map.insert(leaf.to_string(), value);
      }
      None => {
        map.remove(*leaf);
      }
    }
  }
}
