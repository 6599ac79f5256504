//! Shared retry vocabulary for jobs and deliveries.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// How a failure should be treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
  /// Network timeout, provider 5xx, lock contention. Retried with backoff.
  Transient,
  /// Malformed input, invalid recipient. Never retried.
  Permanent,
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
  pub base_secs: u64,
  pub max_secs:  u64,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base_secs: 30,
      max_secs:  3_600,
    }
  }
}

impl BackoffPolicy {
  pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let secs = self.base_secs.saturating_mul(factor).min(self.max_secs);
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
  }

  /// When the next attempt may run, given the number of attempts made so far.
  pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
    now
      .checked_add_signed(self.delay_for_attempt(attempt))
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }
}
