use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public profile of the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
  pub email: String,
  pub nickname: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gender: Option<String>,
  #[serde(default)]
  pub total_points: i64,
  pub created_at: DateTime<Utc>,
  pub last_active: DateTime<Utc>,
}

impl UserProfile {
  pub fn new(email: impl Into<String>, nickname: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      email: email.into(),
      nickname: nickname.into(),
      gender: None,
      total_points: 0,
      created_at: now,
      last_active: now,
    }
  }
}
