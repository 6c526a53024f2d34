use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RetryClass, SyncError};

/// Exponential backoff with jitter for remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(30_000),
    }
  }
}

impl RetryPolicy {
  /// Policy that never waits, for tests.
  pub fn immediate(max_retries: u32) -> Self {
    Self {
      max_retries,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
  /// capped at `max_delay`, then jittered by up to 20% either way.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
    if delay.is_zero() {
      return delay;
    }
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(jitter)
  }

  /// Run `op` until it succeeds, fails with a non-retryable error, or the
  /// retries are exhausted. Returns the last error in the latter cases.
  pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) if e.retry_class() == RetryClass::Retryable && attempt < self.max_retries => {
          let delay = self.delay_for(attempt);
          attempt += 1;
          warn!(
            operation = what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "remote call failed, retrying"
          );
          tokio::time::sleep(delay).await;
        }
        Err(e) => {
          debug!(operation = what, attempts = attempt + 1, error = %e, "giving up");
          return Err(e);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[test]
  fn test_delay_grows_and_is_capped() {
    let policy = RetryPolicy::default();
    for attempt in 0..3 {
      let delay = policy.delay_for(attempt).as_millis() as f64;
      let expected = 1000.0 * 2f64.powi(attempt as i32);
      assert!(delay >= expected * 0.8 - 1.0 && delay <= expected * 1.2 + 1.0);
    }
    assert!(policy.delay_for(20) <= Duration::from_millis(36_000));
  }

  #[tokio::test]
  async fn test_retries_transient_errors_until_success() {
    let calls = AtomicU32::new(0);
    let result = RetryPolicy::immediate(3)
      .run("test", || async {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(SyncError::TransientRemote("timeout".to_string()))
        } else {
          Ok(42)
        }
      })
      .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_gives_up_after_max_retries() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = RetryPolicy::immediate(2)
      .run("test", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::TransientRemote("timeout".to_string()))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_permanent_errors_are_not_retried() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = RetryPolicy::immediate(3)
      .run("test", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::PermanentRemote("denied".to_string()))
      })
      .await;

    assert!(matches!(result, Err(SyncError::PermanentRemote(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
