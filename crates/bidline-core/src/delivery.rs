//! The notification outbox and its delivery state machine.
//!
//! Each `delivery_logs` row moves through five logical states:
//!
//! ```text
//! queued ──claim──▶ processing ──succeed──▶ delivered
//!   ▲                   │
//!   └──requeue── failed_retryable ◀──fail──┤
//!                                          └──fail──▶ failed_terminal
//! ```
//!
//! Only four of them are persisted: a retryable failure is written back as
//! `queued` with a future `next_retry_at`, and a terminal failure as `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
  Error, Result,
  retry::{BackoffPolicy, FailureClass},
  tender::{DeliveryId, RevisionId, SubscriptionId},
};

// ─── States ──────────────────────────────────────────────────────────────────

/// The status column of `delivery_logs`.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeliveryStatus {
  Queued,
  Processing,
  Delivered,
  Failed,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryState {
  Queued,
  Processing,
  Delivered,
  FailedRetryable,
  FailedTerminal,
}

impl DeliveryState {
  pub fn persisted(self) -> DeliveryStatus {
    match self {
      DeliveryState::Queued | DeliveryState::FailedRetryable => DeliveryStatus::Queued,
      DeliveryState::Processing => DeliveryStatus::Processing,
      DeliveryState::Delivered => DeliveryStatus::Delivered,
      DeliveryState::FailedTerminal => DeliveryStatus::Failed,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, DeliveryState::Delivered | DeliveryState::FailedTerminal)
  }
}

// ─── Machine ─────────────────────────────────────────────────────────────────

/// The retry-relevant part of a delivery row, with pure transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMachine {
  pub state:         DeliveryState,
  pub attempt_count: u32,
  pub max_attempts:  u32,
  pub next_retry_at: DateTime<Utc>,
}

impl DeliveryMachine {
  pub fn new(max_attempts: u32, now: DateTime<Utc>) -> Self {
    Self {
      state: DeliveryState::Queued,
      attempt_count: 0,
      max_attempts,
      next_retry_at: now,
    }
  }

  /// Whether a worker may pick this row up at `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.state == DeliveryState::Queued && self.next_retry_at <= now
  }

  /// `queued → processing`.
  pub fn claim(self) -> Result<Self> {
    self.expect(DeliveryState::Queued, "claim")?;
    Ok(Self {
      state: DeliveryState::Processing,
      ..self
    })
  }

  /// `processing → delivered`.
  pub fn succeed(self) -> Result<Self> {
    self.expect(DeliveryState::Processing, "succeed")?;
    Ok(Self {
      state: DeliveryState::Delivered,
      ..self
    })
  }

  /// `processing → failed_retryable | failed_terminal`.
  ///
  /// Increments `attempt_count` exactly once. A permanent failure, or running
  /// out of attempts, is terminal; otherwise `next_retry_at` is pushed out by
  /// `policy`.
  pub fn fail(
    self,
    class: FailureClass,
    policy: &BackoffPolicy,
    now: DateTime<Utc>,
  ) -> Result<Self> {
    self.expect(DeliveryState::Processing, "fail")?;
    let attempt_count = self.attempt_count.saturating_add(1);
    let exhausted = attempt_count >= self.max_attempts;
    if class == FailureClass::Permanent || exhausted {
      return Ok(Self {
        state: DeliveryState::FailedTerminal,
        attempt_count,
        ..self
      });
    }
    Ok(Self {
      state: DeliveryState::FailedRetryable,
      attempt_count,
      next_retry_at: policy.next_attempt_at(now, attempt_count),
      ..self
    })
  }

  /// `failed_retryable → queued`.
  pub fn requeue(self) -> Result<Self> {
    self.expect(DeliveryState::FailedRetryable, "requeue")?;
    Ok(Self {
      state: DeliveryState::Queued,
      ..self
    })
  }

  fn expect(&self, state: DeliveryState, action: &'static str) -> Result<()> {
    if self.state == state {
      Ok(())
    } else {
      Err(Error::InvalidTransition {
        from: self.state,
        action,
      })
    }
  }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// One `delivery_logs` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
  pub id:                    DeliveryId,
  pub subscription_id:       SubscriptionId,
  pub revision_id:           RevisionId,
  pub channel:               String,
  pub event_key:             String,
  pub delivery_status:       DeliveryStatus,
  pub attempt_count:         u32,
  pub max_attempts:          u32,
  pub next_retry_at:         DateTime<Utc>,
  pub last_error:            Option<String>,
  pub processing_started_at: Option<DateTime<Utc>>,
  pub delivered_at:          Option<DateTime<Utc>>,
  pub created_at:            DateTime<Utc>,
}

impl DeliveryLog {
  pub fn machine(&self) -> DeliveryMachine {
    let state = match self.delivery_status {
      DeliveryStatus::Queued => DeliveryState::Queued,
      DeliveryStatus::Processing => DeliveryState::Processing,
      DeliveryStatus::Delivered => DeliveryState::Delivered,
      DeliveryStatus::Failed => DeliveryState::FailedTerminal,
    };
    DeliveryMachine {
      state,
      attempt_count: self.attempt_count,
      max_attempts: self.max_attempts,
      next_retry_at: self.next_retry_at,
    }
  }
}

/// Input to [`TenderStore::enqueue_delivery`](crate::store::TenderStore::enqueue_delivery).
#[derive(Debug, Clone)]
pub struct NewDelivery {
  pub subscription_id: SubscriptionId,
  pub revision_id:     RevisionId,
  pub channel:         String,
  pub max_attempts:    u32,
  pub queued_at:       DateTime<Utc>,
}

impl NewDelivery {
  pub fn event_key(&self) -> String {
    crate::hash::event_key(self.subscription_id, self.revision_id)
  }
}

/// Persisted result of a failed attempt.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
  pub attempt_count: u32,
  pub status:        DeliveryStatus,
  pub next_retry_at: DateTime<Utc>,
  pub error:         String,
}

impl DeliveryFailure {
  /// Build the persisted failure from the machine after [`DeliveryMachine::fail`].
  pub fn from_machine(machine: &DeliveryMachine, error: impl Into<String>) -> Self {
    Self {
      attempt_count: machine.attempt_count,
      status:        machine.state.persisted(),
      next_retry_at: machine.next_retry_at,
      error:         error.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeDelta;

  use super::*;

  fn policy() -> BackoffPolicy {
    BackoffPolicy {
      base_secs: 10,
      max_secs:  600,
    }
  }

  #[test]
  fn failure_then_success_walks_the_full_cycle() {
    let now = Utc::now();
    let mut trail = vec![];

    let m = DeliveryMachine::new(3, now);
    trail.push(m.state.persisted());
    let m = m.claim().unwrap();
    trail.push(m.state.persisted());
    let m = m.fail(FailureClass::Transient, &policy(), now).unwrap();
    assert_eq!(m.state, DeliveryState::FailedRetryable);
    assert_eq!(m.attempt_count, 1);
    assert_eq!(m.next_retry_at, now + TimeDelta::seconds(20));
    assert!(!m.clone().requeue().unwrap().is_due(now));

    let m = m.requeue().unwrap();
    trail.push(m.state.persisted());
    assert!(m.is_due(now + TimeDelta::seconds(20)));
    let m = m.claim().unwrap();
    trail.push(m.state.persisted());
    let m = m.succeed().unwrap();
    trail.push(m.state.persisted());

    assert_eq!(m.attempt_count, 1);
    assert_eq!(
      trail,
      vec![
        DeliveryStatus::Queued,
        DeliveryStatus::Processing,
        DeliveryStatus::Queued,
        DeliveryStatus::Processing,
        DeliveryStatus::Delivered,
      ]
    );
  }

  #[test]
  fn exhausting_attempts_is_terminal() {
    let now = Utc::now();
    let mut m = DeliveryMachine::new(2, now);
    for _ in 0..2 {
      m = m.clone().claim().unwrap();
      m = m.fail(FailureClass::Transient, &policy(), now).unwrap();
      if m.state == DeliveryState::FailedRetryable {
        m = m.requeue().unwrap();
      }
    }
    assert_eq!(m.state, DeliveryState::FailedTerminal);
    assert_eq!(m.attempt_count, 2);
    assert_eq!(m.state.persisted(), DeliveryStatus::Failed);
    assert!(m.claim().is_err());
  }

  #[test]
  fn permanent_failure_skips_retries() {
    let now = Utc::now();
    let m = DeliveryMachine::new(5, now)
      .claim()
      .unwrap()
      .fail(FailureClass::Permanent, &policy(), now)
      .unwrap();
    assert_eq!(m.state, DeliveryState::FailedTerminal);
    assert_eq!(m.attempt_count, 1);
  }

  #[test]
  fn transitions_reject_wrong_source_state() {
    let m = DeliveryMachine::new(3, Utc::now());
    assert!(matches!(
      m.clone().succeed(),
      Err(Error::InvalidTransition {
        from: DeliveryState::Queued,
        ..
      })
    ));
    assert!(m.requeue().is_err());
  }

  #[test]
  fn failed_retryable_persists_as_queued() {
    assert_eq!(DeliveryState::FailedRetryable.persisted(), DeliveryStatus::Queued);
    assert!(DeliveryState::Delivered.is_terminal());
    assert!(!DeliveryState::FailedRetryable.is_terminal());
  }
}
