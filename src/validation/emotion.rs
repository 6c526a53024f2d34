use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;

use super::{Validate, ValidationResult};
use crate::model::{EmotionRecord, EmotionType};
use crate::remote::is_valid_key;

/// Oldest timestamp accepted for a record (2019-01-01).
pub static MIN_TIMESTAMP: Lazy<DateTime<Utc>> =
  Lazy::new(|| Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).single().unwrap_or_default());

pub const MAX_NOTE_LENGTH: usize = 500;

const MIN_ID_LENGTH: usize = 8;
const MAX_ID_LENGTH: usize = 64;

impl Validate for EmotionRecord {
  fn validate(&self) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Some(id) = &self.id {
      if id.is_empty() {
        result.add_error("id", "Record id must not be empty", "ERR_EMPTY_ID");
      } else if id.len() < MIN_ID_LENGTH || id.len() > MAX_ID_LENGTH {
        result.add_error(
          "id",
          format!(
            "Record id must be {} to {} characters",
            MIN_ID_LENGTH, MAX_ID_LENGTH
          ),
          "ERR_INVALID_ID_LENGTH",
        );
      }
      if !id.is_empty() && !is_valid_key(id) {
        result.add_error(
          "id",
          "Record id must not contain '/', '.', '#', '$', '[' or ']'",
          "ERR_INVALID_ID_CHARACTER",
        );
      }
    }

    if self.local_id.trim().is_empty() {
      result.add_error("localId", "Local id must not be empty", "ERR_EMPTY_LOCAL_ID");
    } else if !is_valid_key(&self.local_id) {
      result.add_error(
        "localId",
        "Local id must not contain '/', '.', '#', '$', '[' or ']'",
        "ERR_INVALID_LOCAL_ID_CHARACTER",
      );
    }

    if self.emotion_type.trim().is_empty() {
      result.add_error("type", "Emotion type must not be empty", "ERR_EMPTY_TYPE");
    } else if self.emotion_type.parse::<EmotionType>().is_err() {
      result.add_error(
        "type",
        format!("Unknown emotion type '{}'", self.emotion_type),
        "ERR_UNKNOWN_TYPE",
      );
    }

    if !(0.0..=1.0).contains(&self.intensity) {
      result.add_error(
        "intensity",
        "Intensity must be between 0 and 1",
        "ERR_INVALID_INTENSITY",
      );
    }

    if !(-1.0..=1.0).contains(&self.value) {
      result.add_error("value", "Value must be between -1 and 1", "ERR_INVALID_VALUE");
    }

    if self.color_hex.is_empty() {
      result.add_error("colorHex", "Color must not be empty", "ERR_EMPTY_COLOR");
    } else if !is_hex_color(&self.color_hex) {
      result.add_error(
        "colorHex",
        "Color must be #RRGGBB or #RRGGBBAA",
        "ERR_INVALID_COLOR_FORMAT",
      );
    }

    if self.timestamp < *MIN_TIMESTAMP {
      result.add_error("timestamp", "Timestamp is too old", "ERR_OLD_TIMESTAMP");
    } else if self.timestamp > Utc::now() {
      result.add_error(
        "timestamp",
        "Timestamp must not be in the future",
        "ERR_FUTURE_TIMESTAMP",
      );
    }

    if let Some(note) = &self.note {
      if note.chars().count() > MAX_NOTE_LENGTH {
        result.add_error(
          "note",
          format!("Note must not exceed {} characters", MAX_NOTE_LENGTH),
          "ERR_NOTE_TOO_LONG",
        );
      }
    }

    if let Some(lat) = self.latitude {
      if !(-90.0..=90.0).contains(&lat) {
        result.add_error(
          "latitude",
          "Latitude must be between -90 and 90",
          "ERR_INVALID_LATITUDE",
        );
      }
    }

    if let Some(lon) = self.longitude {
      if !(-180.0..=180.0).contains(&lon) {
        result.add_error(
          "longitude",
          "Longitude must be between -180 and 180",
          "ERR_INVALID_LONGITUDE",
        );
      }
    }

    result
  }
}

fn is_hex_color(color: &str) -> bool {
  let digits = color.strip_prefix('#').unwrap_or(color);
  (digits.len() == 6 || digits.len() == 8) && digits.chars().all(|c| c.is_ascii_hexdigit())
}
