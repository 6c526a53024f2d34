use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};

use crate::validation::ValidationResult;

const FORBIDDEN_CHARS: [char; 5] = ['.', '#', '$', '[', ']'];

/// Whether `key` can be used as a single path segment.
pub fn is_valid_key(key: &str) -> bool {
  !key.trim().is_empty() && !key.contains('/') && !key.contains(&FORBIDDEN_CHARS[..])
}

/// Root of a user's emotion history.
pub fn records_root(user_id: &str) -> String {
  format!("users/{}/emotionHistory", user_id)
}

/// Path of a single emotion record.
pub fn record_path(user_id: &str, key: &str) -> String {
  format!("{}/{}", records_root(user_id), key)
}

/// Reverse index entry of a record under its emotion type.
pub fn type_index_path(user_id: &str, emotion_type: &str, key: &str) -> String {
  format!("users/{}/emotionsByType/{}/{}", user_id, emotion_type, key)
}

pub fn profile_path(user_id: &str) -> String {
  format!("users/{}/profile", user_id)
}

/// Strip surrounding whitespace and slashes.
pub fn normalize_path(path: &str) -> String {
  path.trim().trim_matches('/').to_string()
}

/// Check that `path` addresses a single normalized location: non-empty, no
/// empty segments, none of the reserved characters.
pub fn validate_path(path: &str) -> ValidationResult {
  let mut result = ValidationResult::new();
  let normalized = normalize_path(path);

  if normalized.is_empty() {
    result.add_error("path", "Path must not be empty", "ERR_EMPTY_PATH");
    return result;
  }

  if normalized.split('/').any(|segment| segment.trim().is_empty()) {
    result.add_error(
      "path",
      format!("Path '{}' contains an empty segment", path),
      "ERR_EMPTY_PATH_SEGMENT",
    );
  }

  if normalized.contains(&FORBIDDEN_CHARS[..]) {
    result.add_error(
      "path",
      format!("Path '{}' contains a reserved character", path),
      "ERR_INVALID_PATH_CHARACTER",
    );
  }

  result
}

/// Generate a child key that sorts after keys generated earlier.
pub fn push_key() -> String {
  let suffix: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(8)
    .map(char::from)
    .collect();
  format!("{:012x}{}", Utc::now().timestamp_millis(), suffix)
}
