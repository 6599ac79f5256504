//! Generic retry envelope for pipeline work, plus the dead-letter record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
  hash,
  retry::{BackoffPolicy, FailureClass},
  tender::{JobId, RevisionId},
};

// ─── Payloads ────────────────────────────────────────────────────────────────

/// The unit of work a job carries. Stored as tagged JSON in `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobKind {
  /// Pull one tender from a source adapter.
  Fetch {
    source:       String,
    tender_id:    String,
    requested_at: DateTime<Utc>,
  },
  /// Run an already fetched payload through normalization and the ledger.
  Ingest {
    source:      String,
    tender_id:   String,
    raw_payload: String,
    observed_at: DateTime<Utc>,
  },
  /// Build index artifacts for one revision under one model version.
  Index {
    revision_id:   RevisionId,
    model_version: String,
  },
  /// Match one revision against subscriptions and enqueue deliveries.
  Notify { revision_id: RevisionId },
}

impl JobKind {
  pub fn job_name(&self) -> &'static str {
    match self {
      JobKind::Fetch { .. } => "fetch",
      JobKind::Ingest { .. } => "ingest",
      JobKind::Index { .. } => "index",
      JobKind::Notify { .. } => "notify",
    }
  }

  /// The key that makes re-submitting the same logical work a no-op.
  pub fn idempotency_key(&self) -> String {
    match self {
      JobKind::Fetch {
        source,
        tender_id,
        requested_at,
      } => format!("{source}:{tender_id}:{}", requested_at.timestamp()),
      // One key per observation: the same bytes seen again after a change
      // are new work, and true replays are absorbed by the ledger.
      JobKind::Ingest {
        source,
        tender_id,
        raw_payload,
        observed_at,
      } => format!(
        "{source}:{tender_id}:{}:{}",
        observed_at.timestamp_micros(),
        hash::raw_content_hash(raw_payload)
      ),
      JobKind::Index {
        revision_id,
        model_version,
      } => format!("{revision_id}:{model_version}"),
      JobKind::Notify { revision_id } => revision_id.to_string(),
    }
  }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Leased,
  Completed,
}

/// One `ingestion_jobs` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub id:               JobId,
  pub job_name:         String,
  pub idempotency_key:  String,
  pub kind:             JobKind,
  pub status:           JobStatus,
  pub attempts:         u32,
  pub max_attempts:     u32,
  pub available_at:     DateTime<Utc>,
  pub leased_by:        Option<String>,
  pub lease_expires_at: Option<DateTime<Utc>>,
  pub last_error:       Option<String>,
  pub created_at:       DateTime<Utc>,
}

/// Input to [`TenderStore::enqueue_job`](crate::store::TenderStore::enqueue_job).
#[derive(Debug, Clone)]
pub struct NewJob {
  pub kind:            JobKind,
  pub idempotency_key: String,
  pub max_attempts:    u32,
  pub available_at:    DateTime<Utc>,
}

impl NewJob {
  pub fn new(kind: JobKind, max_attempts: u32, available_at: DateTime<Utc>) -> Self {
    Self {
      idempotency_key: kind.idempotency_key(),
      kind,
      max_attempts,
      available_at,
    }
  }
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
  Enqueued(Job),
  /// A job with the same `(job_name, idempotency_key)` already exists.
  Duplicate,
}

/// A job that exhausted its retry budget or failed permanently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
  pub id:              JobId,
  pub job_name:        String,
  pub idempotency_key: String,
  /// The original payload JSON, kept verbatim for inspection.
  pub payload:         String,
  pub attempts:        u32,
  pub error_message:   String,
  pub failed_at:       DateTime<Utc>,
}

/// Outcome of one expired-lease sweep.
///
/// An expired lease counts as a failed attempt, so a job whose worker keeps
/// dying still reaches its attempt ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSweep {
  pub requeued:      usize,
  pub dead_lettered: usize,
}

/// `last_error` / `error_message` recorded for an expired lease.
pub const LEASE_EXPIRED: &str = "lease expired";

// ─── Policy ──────────────────────────────────────────────────────────────────

/// What to do with a job whose latest attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
  Retry { available_at: DateTime<Utc> },
  DeadLetter,
}

/// Decide the follow-up for a job after `attempts` failed attempts, counting
/// the one that just failed.
pub fn next_step(
  attempts: u32,
  max_attempts: u32,
  class: FailureClass,
  policy: &BackoffPolicy,
  now: DateTime<Utc>,
) -> JobStep {
  if class == FailureClass::Permanent || attempts >= max_attempts {
    JobStep::DeadLetter
  } else {
    JobStep::Retry {
      available_at: policy.next_attempt_at(now, attempts),
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeDelta;

  use super::*;

  #[test]
  fn payload_is_tagged_by_job_name() {
    let kind = JobKind::Index {
      revision_id:   RevisionId(7),
      model_version: "hash-v1".into(),
    };
    let json = serde_json::to_value(&kind).unwrap();
    assert_eq!(json["job"], "index");
    assert_eq!(json["revision_id"], 7);
    assert_eq!(serde_json::from_value::<JobKind>(json).unwrap(), kind);
  }

  #[test]
  fn idempotency_keys_are_stable() {
    let observed = Utc::now();
    let ingest = |raw: &str, observed_at: DateTime<Utc>| JobKind::Ingest {
      source: "narajangter".into(),
      tender_id: "2024-001".into(),
      raw_payload: raw.into(),
      observed_at,
    };
    assert_eq!(
      ingest("{}", observed).idempotency_key(),
      ingest("{}", observed).idempotency_key()
    );
    assert_ne!(
      ingest("{}", observed).idempotency_key(),
      ingest("[]", observed).idempotency_key()
    );
    // Identical bytes observed later (e.g. after a revert) are new work.
    assert_ne!(
      ingest("{}", observed).idempotency_key(),
      ingest("{}", observed + TimeDelta::seconds(60)).idempotency_key()
    );
    assert_eq!(
      JobKind::Notify {
        revision_id: RevisionId(3)
      }
      .idempotency_key(),
      "3"
    );
  }

  #[test]
  fn retries_until_ceiling_then_dead_letters() {
    let policy = BackoffPolicy {
      base_secs: 5,
      max_secs:  100,
    };
    let now = Utc::now();
    assert_eq!(
      next_step(1, 3, FailureClass::Transient, &policy, now),
      JobStep::Retry {
        available_at: now + TimeDelta::seconds(10)
      }
    );
    assert_eq!(
      next_step(3, 3, FailureClass::Transient, &policy, now),
      JobStep::DeadLetter
    );
    assert_eq!(
      next_step(1, 3, FailureClass::Permanent, &policy, now),
      JobStep::DeadLetter
    );
  }
}
