use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::operation::PendingOperation;
use crate::cache::KeyValueRepository;

/// Repository key holding the persisted pending set.
const QUEUE_KEY: &str = "operation_queue";

#[derive(Default)]
struct QueueState {
  /// Waiting and in-flight operations
  operations: Vec<PendingOperation>,
  /// Ids handed out by `next_ready` and not yet completed or released
  in_flight: HashSet<String>,
  next_seq: u64,
}

/// Persistent priority queue of pending remote writes.
///
/// Higher priority drains first, FIFO within a priority. An id is accepted at
/// most once until its operation is completed or abandoned, in flight or not.
pub struct OperationQueue {
  repository: Arc<dyn KeyValueRepository>,
  state: Mutex<QueueState>,
}

impl OperationQueue {
  /// Open the queue, restoring anything persisted by a previous session.
  /// Operations that were in flight when the session ended become ready again.
  pub fn new(repository: Arc<dyn KeyValueRepository>) -> Self {
    let operations = load(repository.as_ref());
    let next_seq = operations.iter().map(|op| op.seq + 1).max().unwrap_or(0);
    if !operations.is_empty() {
      info!(count = operations.len(), "restored pending operations");
    }

    Self {
      repository,
      state: Mutex::new(QueueState {
        operations,
        in_flight: HashSet::new(),
        next_seq,
      }),
    }
  }

  /// Add an operation. Returns `false` and changes nothing if an operation
  /// with the same id is already queued or in flight.
  pub fn enqueue(&self, mut operation: PendingOperation) -> bool {
    let mut state = self.lock();
    if state
      .operations
      .iter()
      .any(|op| op.operation_id == operation.operation_id)
    {
      debug!(operation_id = %operation.operation_id, "duplicate operation rejected");
      return false;
    }

    operation.seq = state.next_seq;
    state.next_seq += 1;
    debug!(
      operation_id = %operation.operation_id,
      priority = operation.priority,
      description = %operation.description,
      "operation queued"
    );
    state.operations.push(operation);
    self.persist(&state);
    true
  }

  /// Take the next operation to deliver and mark it in flight.
  pub fn next_ready(&self) -> Option<PendingOperation> {
    let mut state = self.lock();
    let next = state
      .operations
      .iter()
      .filter(|op| !state.in_flight.contains(&op.operation_id))
      .min_by_key(|op| (std::cmp::Reverse(op.priority), op.seq))
      .cloned()?;
    state.in_flight.insert(next.operation_id.clone());
    Some(next)
  }

  /// Remove an acknowledged operation.
  pub fn complete(&self, operation_id: &str) {
    self.remove(operation_id);
    debug!(operation_id, "operation completed");
  }

  /// Remove an operation that failed permanently.
  pub fn abandon(&self, operation_id: &str) {
    self.remove(operation_id);
    warn!(operation_id, "operation abandoned");
  }

  /// Drop a waiting operation. Operations already in flight are left alone
  /// and `false` is returned.
  pub fn cancel(&self, operation_id: &str) -> bool {
    let mut state = self.lock();
    if state.in_flight.contains(operation_id) {
      return false;
    }
    let before = state.operations.len();
    state.operations.retain(|op| op.operation_id != operation_id);
    let removed = state.operations.len() != before;
    if removed {
      debug!(operation_id, "operation cancelled");
      self.persist(&state);
    }
    removed
  }

  /// Keep a waiting operation out of `next_ready` until it is released.
  pub fn hold(&self, operation_id: &str) {
    let mut state = self.lock();
    if state
      .operations
      .iter()
      .any(|op| op.operation_id == operation_id)
    {
      state.in_flight.insert(operation_id.to_string());
    }
  }

  /// Return an in-flight operation to the ready set without removing it.
  pub fn release(&self, operation_id: &str) {
    self.lock().in_flight.remove(operation_id);
  }

  /// Pending operations in drain order, in flight included.
  pub fn pending(&self) -> Vec<PendingOperation> {
    let state = self.lock();
    let mut operations = state.operations.clone();
    operations.sort_by_key(|op| (std::cmp::Reverse(op.priority), op.seq));
    operations
  }

  pub fn len(&self) -> usize {
    self.lock().operations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, operation_id: &str) -> bool {
    self
      .lock()
      .operations
      .iter()
      .any(|op| op.operation_id == operation_id)
  }

  /// Whether any queued operation delivers the given record.
  pub fn contains_record(&self, record_id: &str) -> bool {
    self
      .lock()
      .operations
      .iter()
      .any(|op| op.record_id.as_deref() == Some(record_id))
  }

  fn remove(&self, operation_id: &str) {
    let mut state = self.lock();
    state.in_flight.remove(operation_id);
    let before = state.operations.len();
    state.operations.retain(|op| op.operation_id != operation_id);
    if state.operations.len() != before {
      self.persist(&state);
    }
  }

  fn persist(&self, state: &QueueState) {
    let result = serde_json::to_string(&state.operations)
      .map_err(|e| e.to_string())
      .and_then(|json| {
        self
          .repository
          .write(QUEUE_KEY, &json)
          .map_err(|e| e.to_string())
      });
    if let Err(e) = result {
      error!(error = %e, "failed to persist operation queue");
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn load(repository: &dyn KeyValueRepository) -> Vec<PendingOperation> {
  let raw = match repository.read(QUEUE_KEY) {
    Ok(Some(raw)) => raw,
    Ok(None) => return Vec::new(),
    Err(e) => {
      error!(error = %e, "failed to read persisted operation queue");
      return Vec::new();
    }
  };

  serde_json::from_str(&raw).unwrap_or_else(|e| {
    warn!(error = %e, "discarding corrupt persisted operation queue");
    Vec::new()
  })
}
