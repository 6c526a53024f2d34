use once_cell::sync::Lazy;
use regex::Regex;

use super::{Validate, ValidationResult};
use crate::model::UserProfile;

const MIN_NICKNAME_LENGTH: usize = 2;
const MAX_NICKNAME_LENGTH: usize = 30;
const GENDERS: [&str; 3] = ["male", "female", "other"];

static EMAIL_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles"));

impl Validate for UserProfile {
  fn validate(&self) -> ValidationResult {
    let mut result = ValidationResult::new();

    if self.email.is_empty() {
      result.add_error("email", "Email must not be empty", "ERR_EMPTY_EMAIL");
    } else if !EMAIL_REGEX.is_match(&self.email) {
      result.add_error("email", "Email format is invalid", "ERR_INVALID_EMAIL");
    }

    let nickname_len = self.nickname.chars().count();
    if nickname_len == 0 {
      result.add_error("nickname", "Nickname must not be empty", "ERR_EMPTY_NICKNAME");
    } else if !(MIN_NICKNAME_LENGTH..=MAX_NICKNAME_LENGTH).contains(&nickname_len) {
      result.add_error(
        "nickname",
        format!(
          "Nickname must be {} to {} characters",
          MIN_NICKNAME_LENGTH, MAX_NICKNAME_LENGTH
        ),
        "ERR_INVALID_NICKNAME_LENGTH",
      );
    }

    if let Some(gender) = self.gender.as_deref().filter(|g| !g.is_empty()) {
      if !GENDERS.iter().any(|g| g.eq_ignore_ascii_case(gender)) {
        result.add_error("gender", "Unsupported gender value", "ERR_INVALID_GENDER");
      }
    }

    if self.total_points < 0 {
      result.add_error(
        "totalPoints",
        "Points must not be negative",
        "ERR_NEGATIVE_POINTS",
      );
    }

    if self.created_at.timestamp() <= 0 {
      result.add_error(
        "createdAt",
        "Creation time must be positive",
        "ERR_INVALID_CREATED_AT",
      );
    }

    if self.last_active.timestamp() <= 0 {
      result.add_error(
        "lastActive",
        "Last activity time must be positive",
        "ERR_INVALID_LAST_ACTIVE",
      );
    } else if self.last_active < self.created_at {
      result.add_error(
        "lastActive",
        "Last activity must not precede profile creation",
        "ERR_LAST_ACTIVE_BEFORE_CREATED",
      );
    }

    result
  }
}
