//! Change notifications keyed by record id.
//!
//! Consumers hold a [`Subscription`] for as long as they want updates;
//! dropping it unsubscribes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

use crate::model::SyncStatus;

/// A record moved between two sync states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
  pub record_id: String,
  pub from: SyncStatus,
  pub to: SyncStatus,
}

type Sender = mpsc::UnboundedSender<StatusChange>;

#[derive(Default)]
struct Subscribers {
  by_record: HashMap<String, Vec<(u64, Sender)>>,
  all: Vec<(u64, Sender)>,
}

/// Fan-out hub for status changes.
#[derive(Clone, Default)]
pub struct StatusEvents {
  inner: Arc<Mutex<Subscribers>>,
  next_id: Arc<AtomicU64>,
}

impl StatusEvents {
  pub fn new() -> Self {
    Self::default()
  }

  /// Receive changes of a single record.
  pub fn subscribe(&self, record_id: &str) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .lock()
      .by_record
      .entry(record_id.to_string())
      .or_default()
      .push((id, tx));
    Subscription {
      id,
      record_id: Some(record_id.to_string()),
      events: self.clone(),
      receiver: rx,
    }
  }

  /// Receive changes of every record.
  pub fn subscribe_all(&self) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.lock().all.push((id, tx));
    Subscription {
      id,
      record_id: None,
      events: self.clone(),
      receiver: rx,
    }
  }

  pub fn publish(&self, change: StatusChange) {
    trace!(record_id = %change.record_id, from = %change.from, to = %change.to, "status change");
    let mut subscribers = self.lock();
    if let Some(senders) = subscribers.by_record.get_mut(&change.record_id) {
      senders.retain(|(_, tx)| tx.send(change.clone()).is_ok());
    }
    subscribers
      .all
      .retain(|(_, tx)| tx.send(change.clone()).is_ok());
  }

  /// Number of live subscriptions.
  pub fn subscriber_count(&self) -> usize {
    let subscribers = self.lock();
    subscribers.all.len() + subscribers.by_record.values().map(Vec::len).sum::<usize>()
  }

  fn unsubscribe(&self, id: u64, record_id: Option<&str>) {
    let mut subscribers = self.lock();
    match record_id {
      Some(record_id) => {
        if let Some(senders) = subscribers.by_record.get_mut(record_id) {
          senders.retain(|(sid, _)| *sid != id);
          if senders.is_empty() {
            subscribers.by_record.remove(record_id);
          }
        }
      }
      None => subscribers.all.retain(|(sid, _)| *sid != id),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Subscribers> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Live subscription; unsubscribes on drop.
pub struct Subscription {
  id: u64,
  record_id: Option<String>,
  events: StatusEvents,
  receiver: mpsc::UnboundedReceiver<StatusChange>,
}

impl Subscription {
  pub async fn recv(&mut self) -> Option<StatusChange> {
    self.receiver.recv().await
  }

  /// Next change if one is already waiting.
  pub fn try_recv(&mut self) -> Option<StatusChange> {
    self.receiver.try_recv().ok()
  }

  /// Every change currently waiting.
  pub fn drain(&mut self) -> Vec<StatusChange> {
    std::iter::from_fn(|| self.try_recv()).collect()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.events.unsubscribe(self.id, self.record_id.as_deref());
  }
}
