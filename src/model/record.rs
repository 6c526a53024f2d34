use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a record stands in the sync lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
  /// Created or edited locally, never attempted
  #[default]
  NotSynced,
  /// An operation for the record has been submitted
  Syncing,
  /// Remote acknowledged the current local version
  Synced,
  /// Delivery failed permanently or exhausted its retries
  SyncFailed,
  /// Local and remote both changed since the last sync
  Conflict,
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::NotSynced => "not synced",
      Self::Syncing => "syncing",
      Self::Synced => "synced",
      Self::SyncFailed => "sync failed",
      Self::Conflict => "conflict",
    };
    f.write_str(name)
  }
}

/// Emotion families a record may belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmotionType {
  Joy,
  Sadness,
  Anger,
  Fear,
  Disgust,
  Trust,
  Anticipation,
  Surprise,
  Love,
  Anxiety,
  Neutral,
}

impl EmotionType {
  pub const ALL: [EmotionType; 11] = [
    Self::Joy,
    Self::Sadness,
    Self::Anger,
    Self::Fear,
    Self::Disgust,
    Self::Trust,
    Self::Anticipation,
    Self::Surprise,
    Self::Love,
    Self::Anxiety,
    Self::Neutral,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Joy => "Joy",
      Self::Sadness => "Sadness",
      Self::Anger => "Anger",
      Self::Fear => "Fear",
      Self::Disgust => "Disgust",
      Self::Trust => "Trust",
      Self::Anticipation => "Anticipation",
      Self::Surprise => "Surprise",
      Self::Love => "Love",
      Self::Anxiety => "Anxiety",
      Self::Neutral => "Neutral",
    }
  }
}

impl FromStr for EmotionType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .iter()
      .copied()
      .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| format!("unknown emotion type '{}'", s))
  }
}

/// A single journal entry.
///
/// `local_id` is generated on the device and doubles as the idempotency key
/// until the remote store assigns `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionRecord {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub local_id: String,
  #[serde(rename = "type")]
  pub emotion_type: String,
  pub value: f32,
  pub intensity: f32,
  pub color_hex: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub note: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub latitude: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub longitude: Option<f64>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tags: Vec<String>,
  pub timestamp: DateTime<Utc>,
  #[serde(default)]
  pub sync_status: SyncStatus,
}

impl EmotionRecord {
  /// Create a fresh local record stamped with the current time.
  pub fn new(emotion_type: EmotionType, value: f32, intensity: f32, color_hex: &str) -> Self {
    Self {
      id: None,
      local_id: uuid::Uuid::new_v4().to_string(),
      emotion_type: emotion_type.as_str().to_string(),
      value,
      intensity,
      color_hex: color_hex.to_string(),
      note: None,
      region_id: None,
      latitude: None,
      longitude: None,
      tags: Vec::new(),
      timestamp: Utc::now(),
      sync_status: SyncStatus::NotSynced,
    }
  }

  pub fn with_note(mut self, note: impl Into<String>) -> Self {
    self.note = Some(note.into());
    self
  }

  /// Key used under the user's remote collection.
  pub fn remote_key(&self) -> &str {
    self.id.as_deref().unwrap_or(&self.local_id)
  }

  /// Compare everything except sync bookkeeping.
  pub fn content_eq(&self, other: &EmotionRecord) -> bool {
    let mut a = self.clone();
    a.sync_status = other.sync_status;
    a == *other
  }

  /// Note text, treating an empty string as absent.
  pub fn note_text(&self) -> Option<&str> {
    self.note.as_deref().filter(|n| !n.is_empty())
  }
}
