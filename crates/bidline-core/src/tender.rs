//! Tenders and their immutable revisions.
//!
//! A tender is one externally tracked announcement identity, `(source,
//! tender_id)`. Every genuine change to its content is recorded as a new
//! [`TenderRevision`]; prior revisions are never updated.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::hash;

// ─── Identifiers ─────────────────────────────────────────────────────────────

macro_rules! row_id {
  ($(#[$meta:meta])* $name:ident) => {
    $(#[$meta])*
    #[derive(
      Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(transparent)]
    pub struct $name(pub i64);

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
      }
    }
  };
}

row_id!(
  /// Primary key of a `tenders` row.
  TenderId
);
row_id!(
  /// Primary key of a `tender_revisions` row.
  RevisionId
);
row_id!(
  /// Primary key of a `subscriptions` row.
  SubscriptionId
);
row_id!(
  /// Primary key of a `delivery_logs` row.
  DeliveryId
);
row_id!(
  /// Primary key of an `ingestion_jobs` or `failed_jobs` row.
  JobId
);

/// The external identity of a tender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenderKey {
  pub source:    String,
  pub tender_id: String,
}

impl TenderKey {
  pub fn new(source: impl Into<String>, tender_id: impl Into<String>) -> Self {
    Self {
      source:    source.into(),
      tender_id: tender_id.into(),
    }
  }
}

impl std::fmt::Display for TenderKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.source, self.tender_id)
  }
}

// ─── Canonical schema ────────────────────────────────────────────────────────

/// A field of the canonical tender schema.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  EnumIter,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldName {
  Title,
  Agency,
  Deadline,
  Budget,
  Region,
  Category,
  Urls,
  Description,
}

/// The canonical, source-independent shape of a tender announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTender {
  pub title:       String,
  pub agency:      Option<String>,
  pub deadline:    Option<NaiveDate>,
  /// Budget in the smallest whole currency unit.
  pub budget:      Option<i64>,
  pub region:      Option<String>,
  pub category:    Option<String>,
  /// Sorted and deduplicated.
  #[serde(default)]
  pub urls:        Vec<String>,
  #[serde(default)]
  pub description: Option<String>,
}

impl NormalizedTender {
  /// Canonical text rendering of one field, `None` when absent.
  ///
  /// Hashing and change detection both compare these renderings, so two
  /// payloads that render identically are the same content.
  pub fn field_value(&self, field: FieldName) -> Option<String> {
    match field {
      FieldName::Title => Some(self.title.clone()),
      FieldName::Agency => self.agency.clone(),
      FieldName::Deadline => self.deadline.map(|d| d.format("%Y-%m-%d").to_string()),
      FieldName::Budget => self.budget.map(|b| b.to_string()),
      FieldName::Region => self.region.clone(),
      FieldName::Category => self.category.clone(),
      FieldName::Urls => (!self.urls.is_empty()).then(|| self.urls.join(" ")),
      FieldName::Description => self.description.clone(),
    }
  }

  /// Whether the tender is still open for bids on `today`.
  pub fn status_on(&self, today: NaiveDate) -> TenderStatus {
    match self.deadline {
      Some(deadline) if deadline < today => TenderStatus::Closed,
      _ => TenderStatus::Active,
    }
  }
}

// ─── Tender ──────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TenderStatus {
  Active,
  Closed,
}

/// The mutable pointer row for one tender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tender {
  pub id:                             TenderId,
  pub source:                         String,
  pub tender_id:                      String,
  pub title:                          String,
  pub agency:                         Option<String>,
  pub status:                         TenderStatus,
  pub current_revision_id:            Option<RevisionId>,
  pub latest_raw_content_hash:        Option<String>,
  pub latest_normalized_content_hash: Option<String>,
  pub first_seen_at:                  DateTime<Utc>,
  pub last_seen_at:                   DateTime<Utc>,
}

impl Tender {
  pub fn key(&self) -> TenderKey { TenderKey::new(&self.source, &self.tender_id) }
}

/// The subset of a tender the change detector needs before writing.
#[derive(Debug, Clone)]
pub struct TenderHead {
  pub id:                             TenderId,
  pub current_revision_id:            Option<RevisionId>,
  pub latest_raw_content_hash:        Option<String>,
  pub latest_normalized_content_hash: Option<String>,
}

// ─── Revisions ───────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RevisionStatus {
  Success,
  Failed,
}

/// One immutable snapshot of a tender's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenderRevision {
  pub id:                      RevisionId,
  pub tender_id:               TenderId,
  pub revision_number:         i64,
  pub revision_hash:           String,
  pub raw_content_hash:        String,
  pub normalized_content_hash: Option<String>,
  pub source_payload:          String,
  pub normalized_payload:      Option<NormalizedTender>,
  pub changed_fields:          BTreeSet<FieldName>,
  pub revision_status:         RevisionStatus,
  pub error_message:           Option<String>,
  pub observed_at:             DateTime<Utc>,
  pub created_at:              DateTime<Utc>,
}

/// The immutable capture of the bytes that produced a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
  pub revision_id:  RevisionId,
  pub content_hash: String,
  pub payload:      String,
  pub captured_at:  DateTime<Utc>,
}

/// Result of running the normalizer over a raw payload.
#[derive(Debug, Clone)]
pub enum Normalization {
  Success(NormalizedTender),
  Failed { error: String },
}

impl Normalization {
  pub fn normalized(&self) -> Option<&NormalizedTender> {
    match self {
      Normalization::Success(n) => Some(n),
      Normalization::Failed { .. } => None,
    }
  }
}

/// Input to [`TenderStore::append_revision`](crate::store::TenderStore::append_revision).
#[derive(Debug, Clone)]
pub struct NewRevision {
  pub key:                     TenderKey,
  pub source_payload:          String,
  pub raw_content_hash:        String,
  pub normalized_content_hash: Option<String>,
  pub normalization:           Normalization,
  pub observed_at:             DateTime<Utc>,
}

impl NewRevision {
  /// Build a revision input, computing both content hashes.
  pub fn new(
    key: TenderKey,
    source_payload: String,
    normalization: Normalization,
    observed_at: DateTime<Utc>,
  ) -> Self {
    let raw_content_hash = hash::raw_content_hash(&source_payload);
    let normalized_content_hash =
      normalization.normalized().map(hash::normalized_content_hash);
    Self {
      key,
      source_payload,
      raw_content_hash,
      normalized_content_hash,
      normalization,
      observed_at,
    }
  }

  pub fn status(&self) -> RevisionStatus {
    match self.normalization {
      Normalization::Success(_) => RevisionStatus::Success,
      Normalization::Failed { .. } => RevisionStatus::Failed,
    }
  }
}

/// What [`TenderStore::append_revision`](crate::store::TenderStore::append_revision)
/// did with an observation.
#[derive(Debug, Clone)]
pub enum RevisionOutcome {
  /// The content was already recorded; only `last_seen_at` moved.
  NoOp { tender_id: TenderId },
  /// A new revision row was written.
  Created {
    revision:       TenderRevision,
    /// `true` when the tender now points at this revision.
    became_current: bool,
  },
}
