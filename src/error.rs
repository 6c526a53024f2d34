//! Error types for the sync engine.

use thiserror::Error;

use crate::validation::ValidationResult;

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
  Retryable,
  Permanent,
}

/// Failure reported by the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// Network hiccup, timeout, service unavailable
  #[error("transient remote error: {0}")]
  Transient(String),

  /// Rejected by the remote store (permissions, rules, bad path)
  #[error("remote rejected operation: {0}")]
  Permanent(String),
}

impl RemoteError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient(message.into())
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self::Permanent(message.into())
  }

  /// Classify error for retry policy.
  pub fn retry_class(&self) -> RetryClass {
    match self {
      Self::Transient(_) => RetryClass::Retryable,
      Self::Permanent(_) => RetryClass::Permanent,
    }
  }
}

/// Errors surfaced by the sync engine.
///
/// Conflicts are not errors: they are routed through the status tracker and
/// the conflict resolver.
#[derive(Debug, Error)]
pub enum SyncError {
  /// The entity failed the validation gate and was not written anywhere
  #[error("validation failed: {0}")]
  Validation(ValidationResult),

  /// Remote failure that may succeed on retry
  #[error("transient remote error: {0}")]
  TransientRemote(String),

  /// Remote failure that will not succeed on retry
  #[error("permanent remote error: {0}")]
  PermanentRemote(String),

  /// JSON serialization/deserialization error
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Local persistence failure
  #[error("storage error: {0}")]
  Storage(String),

  /// Caller passed something unusable (empty key, malformed path)
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// Nothing stored at the requested location
  #[error("not found: {0}")]
  NotFound(String),
}

impl SyncError {
  pub fn storage(message: impl std::fmt::Display) -> Self {
    Self::Storage(message.to_string())
  }

  pub fn invalid_argument(message: impl Into<String>) -> Self {
    Self::InvalidArgument(message.into())
  }

  /// Classify error for retry policy. Only transient remote failures retry.
  pub fn retry_class(&self) -> RetryClass {
    match self {
      Self::TransientRemote(_) => RetryClass::Retryable,
      _ => RetryClass::Permanent,
    }
  }

  /// The validation report if this is a validation error.
  pub fn validation(&self) -> Option<&ValidationResult> {
    match self {
      Self::Validation(result) => Some(result),
      _ => None,
    }
  }
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Transient(message) => Self::TransientRemote(message),
      RemoteError::Permanent(message) => Self::PermanentRemote(message),
    }
  }
}

impl From<ValidationResult> for SyncError {
  fn from(result: ValidationResult) -> Self {
    Self::Validation(result)
  }
}
