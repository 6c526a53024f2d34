use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::strategy::ConflictStrategy;
use crate::cache::KeyValueRepository;
use crate::error::{Result, SyncError};
use crate::model::{EmotionRecord, SyncStatus};
use crate::validation::MAX_NOTE_LENGTH;

/// Repository key of the remembered strategy.
const PREFERRED_STRATEGY_KEY: &str = "conflict_strategy";

const LOCAL_LABEL: &str = "[local] ";
const REMOTE_LABEL: &str = "\n[remote] ";

/// Whether `local` and `remote` both diverged from `base`, the version the
/// remote store last acknowledged.
///
/// Content-equal versions never conflict. A record that was never synced
/// conflicts with any differing remote version.
pub fn is_conflict(
  local: &EmotionRecord,
  remote: &EmotionRecord,
  base: Option<&EmotionRecord>,
) -> bool {
  if local.content_eq(remote) {
    return false;
  }
  match base {
    Some(base) => !local.content_eq(base) && !remote.content_eq(base),
    None => true,
  }
}

/// Remote version as the base, local identity kept, notes combined.
pub fn merge_records(local: &EmotionRecord, remote: &EmotionRecord) -> EmotionRecord {
  let mut merged = remote.clone();
  merged.local_id = local.local_id.clone();
  if merged.id.is_none() {
    merged.id = local.id.clone();
  }

  merged.note = match (local.note_text(), remote.note_text()) {
    (Some(mine), Some(theirs)) if mine != theirs => Some(merge_notes(mine, theirs)),
    (Some(mine), None) => Some(mine.to_string()),
    _ => remote.note.clone(),
  };
  merged
}

/// Both notes labeled by origin, shortened so the result stays within
/// `MAX_NOTE_LENGTH`. A side that fits in half the budget is kept whole.
fn merge_notes(mine: &str, theirs: &str) -> String {
  let budget = MAX_NOTE_LENGTH - LOCAL_LABEL.len() - REMOTE_LABEL.len();
  let (mine_len, theirs_len) = (mine.chars().count(), theirs.chars().count());

  let (mine_max, theirs_max) = if mine_len + theirs_len <= budget {
    (mine_len, theirs_len)
  } else if mine_len <= budget / 2 {
    (mine_len, budget - mine_len)
  } else if theirs_len <= budget - budget / 2 {
    (budget - theirs_len, theirs_len)
  } else {
    (budget / 2, budget - budget / 2)
  };

  format!(
    "{}{}{}{}",
    LOCAL_LABEL,
    truncate(mine, mine_max),
    REMOTE_LABEL,
    truncate(theirs, theirs_max)
  )
}

fn truncate(text: &str, max: usize) -> String {
  if text.chars().count() <= max {
    return text.to_string();
  }
  let mut shortened: String = text.chars().take(max.saturating_sub(1)).collect();
  shortened.push('…');
  shortened
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
  /// New authoritative version of the conflicted record
  pub record: EmotionRecord,
  /// Local version preserved as a separate record
  pub copy: Option<EmotionRecord>,
}

impl Resolution {
  fn single(record: EmotionRecord) -> Self {
    Self { record, copy: None }
  }

  /// Remote version for the record, local version under a fresh local id.
  fn keep_both(local: &EmotionRecord, remote: &EmotionRecord) -> Self {
    let mut record = remote.clone();
    record.local_id = local.local_id.clone();

    let mut copy = local.clone();
    copy.local_id = uuid::Uuid::new_v4().to_string();
    copy.id = None;
    copy.sync_status = SyncStatus::NotSynced;

    Self {
      record,
      copy: Some(copy),
    }
  }
}

/// What the user picked in the resolution prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictChoice {
  UseLocal,
  UseRemote,
  Merge,
  KeepBoth,
  /// A record edited by hand
  Custom(EmotionRecord),
  Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDecision {
  pub choice: ConflictChoice,
  /// Store the matching strategy as the user's preference
  pub remember: bool,
}

impl ConflictDecision {
  pub fn new(choice: ConflictChoice) -> Self {
    Self {
      choice,
      remember: false,
    }
  }

  pub fn remembered(choice: ConflictChoice) -> Self {
    Self {
      choice,
      remember: true,
    }
  }
}

/// A pending prompt delivered to the UI. Dropping it without answering
/// counts as a cancellation.
#[derive(Debug)]
pub struct ConflictRequest {
  pub local: EmotionRecord,
  pub remote: EmotionRecord,
  reply: oneshot::Sender<ConflictDecision>,
}

impl ConflictRequest {
  /// Whether the notes differ enough for a merge to keep both.
  pub fn can_merge(&self) -> bool {
    matches!(
      (self.local.note_text(), self.remote.note_text()),
      (Some(a), Some(b)) if a != b
    )
  }

  pub fn respond(self, decision: ConflictDecision) {
    if self.reply.send(decision).is_err() {
      debug!(record_id = %self.local.local_id, "conflict prompt answered after caller left");
    }
  }

  pub fn cancel(self) {
    self.respond(ConflictDecision::new(ConflictChoice::Cancelled));
  }
}

/// Picks or asks for a resolution strategy and produces the resolved record.
pub struct ConflictResolver {
  repository: Arc<dyn KeyValueRepository>,
  default_strategy: ConflictStrategy,
  cancel_fallback: ConflictStrategy,
  prompts: Mutex<Option<mpsc::UnboundedSender<ConflictRequest>>>,
  pending: AtomicUsize,
}

impl ConflictResolver {
  pub fn new(
    repository: Arc<dyn KeyValueRepository>,
    default_strategy: ConflictStrategy,
    cancel_fallback: ConflictStrategy,
  ) -> Self {
    // Manual cannot be its own fallback
    let cancel_fallback = match cancel_fallback {
      ConflictStrategy::Manual => ConflictStrategy::ServerWins,
      other => other,
    };
    Self {
      repository,
      default_strategy,
      cancel_fallback,
      prompts: Mutex::new(None),
      pending: AtomicUsize::new(0),
    }
  }

  /// Attach a UI. Manual resolutions are sent to the returned receiver;
  /// attaching again replaces the previous UI.
  pub fn connect_ui(&self) -> mpsc::UnboundedReceiver<ConflictRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    *self.lock_prompts() = Some(tx);
    rx
  }

  pub fn cancel_fallback(&self) -> ConflictStrategy {
    self.cancel_fallback
  }

  /// Stored preference, else the configured default.
  pub fn preferred_strategy(&self) -> ConflictStrategy {
    match self.repository.read(PREFERRED_STRATEGY_KEY) {
      Ok(Some(raw)) => raw.parse().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring stored conflict strategy");
        self.default_strategy
      }),
      Ok(None) => self.default_strategy,
      Err(e) => {
        error!(error = %e, "failed to read stored conflict strategy");
        self.default_strategy
      }
    }
  }

  pub fn set_preferred_strategy(&self, strategy: ConflictStrategy) -> Result<()> {
    self
      .repository
      .write(PREFERRED_STRATEGY_KEY, strategy.as_str())
      .map_err(SyncError::storage)?;
    info!(%strategy, "conflict strategy preference saved");
    Ok(())
  }

  /// Manual resolutions currently waiting for the user.
  pub fn pending_conflicts(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }

  /// Resolve without suspending. `Manual` cannot wait for the user here and
  /// applies the cancel fallback.
  pub fn resolve(
    &self,
    local: &EmotionRecord,
    remote: &EmotionRecord,
    strategy: Option<ConflictStrategy>,
  ) -> Resolution {
    if local.content_eq(remote) {
      return Resolution::single(local.clone());
    }

    let strategy = strategy.unwrap_or_else(|| self.preferred_strategy());
    let strategy = match strategy {
      ConflictStrategy::Manual => {
        warn!(
          record_id = %local.local_id,
          fallback = %self.cancel_fallback,
          "manual resolution requested synchronously, using fallback"
        );
        self.cancel_fallback
      }
      other => other,
    };

    debug!(record_id = %local.local_id, %strategy, "resolving conflict");
    apply(strategy, local, remote)
  }

  /// Ask the attached UI and wait for its decision. Without a UI, or when the
  /// prompt is cancelled or dropped, the cancel fallback applies.
  pub async fn resolve_interactively(
    &self,
    local: &EmotionRecord,
    remote: &EmotionRecord,
  ) -> Resolution {
    if local.content_eq(remote) {
      return Resolution::single(local.clone());
    }

    let (reply, answer) = oneshot::channel();
    let request = ConflictRequest {
      local: local.clone(),
      remote: remote.clone(),
      reply,
    };

    let sent = match self.lock_prompts().as_ref() {
      Some(prompts) => prompts.send(request).is_ok(),
      None => false,
    };
    if !sent {
      warn!(record_id = %local.local_id, "no conflict UI attached, using fallback");
      return apply(self.cancel_fallback, local, remote);
    }

    self.pending.fetch_add(1, Ordering::SeqCst);
    let decision = answer.await;
    self.pending.fetch_sub(1, Ordering::SeqCst);

    let decision = match decision {
      Ok(decision) => decision,
      Err(_) => {
        warn!(record_id = %local.local_id, "conflict prompt abandoned, using fallback");
        return apply(self.cancel_fallback, local, remote);
      }
    };

    let remembered = match &decision.choice {
      ConflictChoice::UseLocal => Some(ConflictStrategy::ClientWins),
      ConflictChoice::UseRemote => Some(ConflictStrategy::ServerWins),
      ConflictChoice::Merge => Some(ConflictStrategy::Merge),
      ConflictChoice::KeepBoth => Some(ConflictStrategy::KeepBoth),
      ConflictChoice::Custom(_) | ConflictChoice::Cancelled => None,
    };
    if decision.remember {
      if let Some(strategy) = remembered {
        if let Err(e) = self.set_preferred_strategy(strategy) {
          error!(error = %e, "failed to remember conflict strategy");
        }
      }
    }

    match decision.choice {
      ConflictChoice::UseLocal => Resolution::single(local.clone()),
      ConflictChoice::UseRemote => Resolution::single(remote.clone()),
      ConflictChoice::Merge => Resolution::single(merge_records(local, remote)),
      ConflictChoice::KeepBoth => Resolution::keep_both(local, remote),
      ConflictChoice::Custom(record) => Resolution::single(record),
      ConflictChoice::Cancelled => {
        info!(record_id = %local.local_id, "conflict prompt cancelled, using fallback");
        apply(self.cancel_fallback, local, remote)
      }
    }
  }

  fn lock_prompts(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ConflictRequest>>> {
    self.prompts.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn apply(strategy: ConflictStrategy, local: &EmotionRecord, remote: &EmotionRecord) -> Resolution {
  match strategy {
    ConflictStrategy::ClientWins => Resolution::single(local.clone()),
    ConflictStrategy::ServerWins | ConflictStrategy::Manual => Resolution::single(remote.clone()),
    ConflictStrategy::MostRecent => {
      if local.timestamp >= remote.timestamp {
        Resolution::single(local.clone())
      } else {
        Resolution::single(remote.clone())
      }
    }
    ConflictStrategy::Merge => Resolution::single(merge_records(local, remote)),
    ConflictStrategy::KeepBoth => Resolution::keep_both(local, remote),
  }
}
