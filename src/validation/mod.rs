//! Validation gate.
//!
//! Every entity passes through here before it may reach the cache or the
//! operation queue. Rules never short-circuit: a single call reports the
//! complete defect set.

mod emotion;
mod profile;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use emotion::{MAX_NOTE_LENGTH, MIN_TIMESTAMP};

/// One failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
  pub field: String,
  pub message: String,
  pub code: String,
}

/// Outcome of a validation call. Built fresh per call, never mutated after return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
  errors: Vec<FieldError>,
}

impl ValidationResult {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_error(&mut self, field: &str, message: impl Into<String>, code: &str) {
    self.errors.push(FieldError {
      field: field.to_string(),
      message: message.into(),
      code: code.to_string(),
    });
  }

  pub fn is_valid(&self) -> bool {
    self.errors.is_empty()
  }

  pub fn errors(&self) -> &[FieldError] {
    &self.errors
  }

  /// Whether any error carries the given code.
  pub fn has_code(&self, code: &str) -> bool {
    self.errors.iter().any(|e| e.code == code)
  }

  /// Whether any error concerns the given field.
  pub fn has_field(&self, field: &str) -> bool {
    self.errors.iter().any(|e| e.field == field)
  }

  /// Fold another result in, prefixing its field names.
  pub fn merge_prefixed(&mut self, prefix: &str, other: ValidationResult) {
    for mut error in other.errors {
      error.field = format!("{}.{}", prefix, error.field);
      self.errors.push(error);
    }
  }

  /// `Ok(())` when valid, otherwise the result itself as the error.
  pub fn into_result(self) -> Result<(), ValidationResult> {
    if self.is_valid() {
      Ok(())
    } else {
      Err(self)
    }
  }
}

impl fmt::Display for ValidationResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.errors.is_empty() {
      return f.write_str("valid");
    }
    let parts: Vec<String> = self
      .errors
      .iter()
      .map(|e| format!("{} ({}): {}", e.field, e.code, e.message))
      .collect();
    f.write_str(&parts.join("; "))
  }
}

/// Entities that can be checked by the validation gate.
pub trait Validate {
  fn validate(&self) -> ValidationResult;

  fn is_valid(&self) -> bool {
    self.validate().is_valid()
  }
}
