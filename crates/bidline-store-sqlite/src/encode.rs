//! Encoding and decoding helpers between domain types and SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings with microsecond
//! precision and a `Z` suffix, so lexical comparison in SQL is chronological.
//! Structured fields (normalized payloads, criteria, explanations) are
//! compact JSON. Embeddings are little-endian `f32` blobs.

use std::{collections::BTreeSet, str::FromStr};

use bidline_core::{
  delivery::{DeliveryLog, DeliveryStatus},
  index::{IndexChunk, IndexDocument},
  jobs::{FailedJob, Job, JobStatus},
  matching::MatchResult,
  subscription::Subscription,
  tender::{
    DeliveryId, FieldName, JobId, RawPayload, RevisionId, RevisionStatus,
    SubscriptionId, Tender, TenderId, TenderRevision, TenderStatus,
  },
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_variant<T: FromStr>(kind: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| Error::UnknownVariant {
    kind,
    value: s.to_owned(),
  })
}

pub fn encode_embedding(v: &[f32]) -> Vec<u8> {
  v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(b: &[u8]) -> Vec<f32> {
  b.chunks_exact(4)
    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    .collect()
}

fn to_u32(n: i64) -> u32 { u32::try_from(n).unwrap_or(u32::MAX) }

// ─── Tender ──────────────────────────────────────────────────────────────────

pub const TENDER_COLUMNS: &str = "id, source, tender_id, title, agency, status, \
  current_revision_id, latest_raw_content_hash, latest_normalized_content_hash, \
  first_seen_at, last_seen_at";

pub struct RawTender {
  id:                  i64,
  source:              String,
  tender_id:           String,
  title:               String,
  agency:              Option<String>,
  status:              String,
  current_revision_id: Option<i64>,
  latest_raw:          Option<String>,
  latest_normalized:   Option<String>,
  first_seen_at:       String,
  last_seen_at:        String,
}

impl RawTender {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                  row.get(0)?,
      source:              row.get(1)?,
      tender_id:           row.get(2)?,
      title:               row.get(3)?,
      agency:              row.get(4)?,
      status:              row.get(5)?,
      current_revision_id: row.get(6)?,
      latest_raw:          row.get(7)?,
      latest_normalized:   row.get(8)?,
      first_seen_at:       row.get(9)?,
      last_seen_at:        row.get(10)?,
    })
  }

  pub fn into_tender(self) -> Result<Tender> {
    Ok(Tender {
      id:                             TenderId(self.id),
      source:                         self.source,
      tender_id:                      self.tender_id,
      title:                          self.title,
      agency:                         self.agency,
      status:                         decode_variant::<TenderStatus>("tender status", &self.status)?,
      current_revision_id:            self.current_revision_id.map(RevisionId),
      latest_raw_content_hash:        self.latest_raw,
      latest_normalized_content_hash: self.latest_normalized,
      first_seen_at:                  decode_dt(&self.first_seen_at)?,
      last_seen_at:                   decode_dt(&self.last_seen_at)?,
    })
  }
}

// ─── Revision ────────────────────────────────────────────────────────────────

pub const REVISION_COLUMNS: &str = "id, tender_pk, revision_number, revision_hash, \
  raw_content_hash, normalized_content_hash, source_payload, normalized_payload, \
  changed_fields, revision_status, error_message, observed_at, created_at";

pub struct RawRevision {
  pub id:                      i64,
  pub tender_pk:               i64,
  pub revision_number:         i64,
  pub revision_hash:           String,
  pub raw_content_hash:        String,
  pub normalized_content_hash: Option<String>,
  pub source_payload:          String,
  pub normalized_payload:      Option<String>,
  pub changed_fields:          String,
  pub revision_status:         String,
  pub error_message:           Option<String>,
  pub observed_at:             String,
  pub created_at:              String,
}

impl RawRevision {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                      row.get(0)?,
      tender_pk:               row.get(1)?,
      revision_number:         row.get(2)?,
      revision_hash:           row.get(3)?,
      raw_content_hash:        row.get(4)?,
      normalized_content_hash: row.get(5)?,
      source_payload:          row.get(6)?,
      normalized_payload:      row.get(7)?,
      changed_fields:          row.get(8)?,
      revision_status:         row.get(9)?,
      error_message:           row.get(10)?,
      observed_at:             row.get(11)?,
      created_at:              row.get(12)?,
    })
  }

  pub fn into_revision(self) -> Result<TenderRevision> {
    let changed_fields: BTreeSet<FieldName> = serde_json::from_str(&self.changed_fields)?;
    Ok(TenderRevision {
      id: RevisionId(self.id),
      tender_id: TenderId(self.tender_pk),
      revision_number: self.revision_number,
      revision_hash: self.revision_hash,
      raw_content_hash: self.raw_content_hash,
      normalized_content_hash: self.normalized_content_hash,
      source_payload: self.source_payload,
      normalized_payload: self
        .normalized_payload
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?,
      changed_fields,
      revision_status: decode_variant::<RevisionStatus>(
        "revision status",
        &self.revision_status,
      )?,
      error_message: self.error_message,
      observed_at: decode_dt(&self.observed_at)?,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

pub struct RawPayloadRow {
  revision_pk:  i64,
  content_hash: String,
  payload:      String,
  captured_at:  String,
}

impl RawPayloadRow {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      revision_pk:  row.get(0)?,
      content_hash: row.get(1)?,
      payload:      row.get(2)?,
      captured_at:  row.get(3)?,
    })
  }

  pub fn into_payload(self) -> Result<RawPayload> {
    Ok(RawPayload {
      revision_id:  RevisionId(self.revision_pk),
      content_hash: self.content_hash,
      payload:      self.payload,
      captured_at:  decode_dt(&self.captured_at)?,
    })
  }
}

// ─── Index ───────────────────────────────────────────────────────────────────

pub const DOCUMENT_COLUMNS: &str = "d.tender_revision_pk, d.tender_pk, d.title, \
  d.agency, d.region, d.category, d.deadline, d.budget, d.body, d.created_at";

pub struct RawDocument {
  revision_pk: i64,
  tender_pk:   i64,
  title:       String,
  agency:      Option<String>,
  region:      Option<String>,
  category:    Option<String>,
  deadline:    Option<String>,
  budget:      Option<i64>,
  body:        String,
  created_at:  String,
}

impl RawDocument {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      revision_pk: row.get(0)?,
      tender_pk:   row.get(1)?,
      title:       row.get(2)?,
      agency:      row.get(3)?,
      region:      row.get(4)?,
      category:    row.get(5)?,
      deadline:    row.get(6)?,
      budget:      row.get(7)?,
      body:        row.get(8)?,
      created_at:  row.get(9)?,
    })
  }

  pub fn into_document(self) -> Result<IndexDocument> {
    Ok(IndexDocument {
      revision_id: RevisionId(self.revision_pk),
      tender_id:   TenderId(self.tender_pk),
      title:       self.title,
      agency:      self.agency,
      region:      self.region,
      category:    self.category,
      deadline:    self.deadline.as_deref().map(decode_date).transpose()?,
      budget:      self.budget,
      body:        self.body,
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}

pub const CHUNK_COLUMNS: &str = "c.tender_revision_pk, c.chunk_index, c.chunk_hash, \
  c.model_version, c.text, c.embedding, c.created_at";

pub struct RawChunk {
  revision_pk:   i64,
  chunk_index:   i64,
  chunk_hash:    String,
  model_version: String,
  text:          String,
  embedding:     Vec<u8>,
  created_at:    String,
}

impl RawChunk {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      revision_pk:   row.get(0)?,
      chunk_index:   row.get(1)?,
      chunk_hash:    row.get(2)?,
      model_version: row.get(3)?,
      text:          row.get(4)?,
      embedding:     row.get(5)?,
      created_at:    row.get(6)?,
    })
  }

  pub fn into_chunk(self) -> Result<IndexChunk> {
    Ok(IndexChunk {
      revision_id:   RevisionId(self.revision_pk),
      chunk_index:   usize::try_from(self.chunk_index).unwrap_or_default(),
      chunk_hash:    self.chunk_hash,
      model_version: self.model_version,
      text:          self.text,
      embedding:     decode_embedding(&self.embedding),
      created_at:    decode_dt(&self.created_at)?,
    })
  }
}

// ─── Subscriptions & matches ─────────────────────────────────────────────────

pub const SUBSCRIPTION_COLUMNS: &str =
  "id, user_ref, name, channels, criteria, profile_fields, active, created_at";

pub struct RawSubscription {
  id:             i64,
  user_ref:       String,
  name:           String,
  channels:       String,
  criteria:       String,
  profile_fields: String,
  active:         bool,
  created_at:     String,
}

impl RawSubscription {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:             row.get(0)?,
      user_ref:       row.get(1)?,
      name:           row.get(2)?,
      channels:       row.get(3)?,
      criteria:       row.get(4)?,
      profile_fields: row.get(5)?,
      active:         row.get(6)?,
      created_at:     row.get(7)?,
    })
  }

  pub fn into_subscription(self) -> Result<Subscription> {
    Ok(Subscription {
      id:             SubscriptionId(self.id),
      user_ref:       self.user_ref,
      name:           self.name,
      channels:       serde_json::from_str(&self.channels)?,
      criteria:       serde_json::from_str(&self.criteria)?,
      profile_fields: serde_json::from_str(&self.profile_fields)?,
      active:         self.active,
      created_at:     decode_dt(&self.created_at)?,
    })
  }
}

pub const MATCH_COLUMNS: &str = "subscription_pk, tender_revision_pk, fit_score, \
  is_match, signal_count, explanation, evaluated_at";

pub struct RawMatch {
  subscription_pk: i64,
  revision_pk:     i64,
  fit_score:       f64,
  is_match:        bool,
  signal_count:    i64,
  explanation:     String,
  evaluated_at:    String,
}

impl RawMatch {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subscription_pk: row.get(0)?,
      revision_pk:     row.get(1)?,
      fit_score:       row.get(2)?,
      is_match:        row.get(3)?,
      signal_count:    row.get(4)?,
      explanation:     row.get(5)?,
      evaluated_at:    row.get(6)?,
    })
  }

  pub fn into_match(self) -> Result<MatchResult> {
    Ok(MatchResult {
      subscription_id: SubscriptionId(self.subscription_pk),
      revision_id:     RevisionId(self.revision_pk),
      fit_score:       self.fit_score,
      is_match:        self.is_match,
      signal_count:    to_u32(self.signal_count),
      explanation:     serde_json::from_str(&self.explanation)?,
      evaluated_at:    decode_dt(&self.evaluated_at)?,
    })
  }
}

// ─── Deliveries ──────────────────────────────────────────────────────────────

pub const DELIVERY_COLUMNS: &str = "id, subscription_pk, tender_revision_pk, channel, \
  event_key, delivery_status, attempt_count, max_attempts, next_retry_at, last_error, \
  processing_started_at, delivered_at, created_at";

pub struct RawDelivery {
  id:                    i64,
  subscription_pk:       i64,
  revision_pk:           i64,
  channel:               String,
  event_key:             String,
  delivery_status:       String,
  attempt_count:         i64,
  max_attempts:          i64,
  next_retry_at:         String,
  last_error:            Option<String>,
  processing_started_at: Option<String>,
  delivered_at:          Option<String>,
  created_at:            String,
}

impl RawDelivery {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                    row.get(0)?,
      subscription_pk:       row.get(1)?,
      revision_pk:           row.get(2)?,
      channel:               row.get(3)?,
      event_key:             row.get(4)?,
      delivery_status:       row.get(5)?,
      attempt_count:         row.get(6)?,
      max_attempts:          row.get(7)?,
      next_retry_at:         row.get(8)?,
      last_error:            row.get(9)?,
      processing_started_at: row.get(10)?,
      delivered_at:          row.get(11)?,
      created_at:            row.get(12)?,
    })
  }

  pub fn id(&self) -> i64 { self.id }

  pub fn into_delivery(self) -> Result<DeliveryLog> {
    Ok(DeliveryLog {
      id:                    DeliveryId(self.id),
      subscription_id:       SubscriptionId(self.subscription_pk),
      revision_id:           RevisionId(self.revision_pk),
      channel:               self.channel,
      event_key:             self.event_key,
      delivery_status:       decode_variant::<DeliveryStatus>(
        "delivery status",
        &self.delivery_status,
      )?,
      attempt_count:         to_u32(self.attempt_count),
      max_attempts:          to_u32(self.max_attempts),
      next_retry_at:         decode_dt(&self.next_retry_at)?,
      last_error:            self.last_error,
      processing_started_at: decode_opt_dt(self.processing_started_at)?,
      delivered_at:          decode_opt_dt(self.delivered_at)?,
      created_at:            decode_dt(&self.created_at)?,
    })
  }
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

pub const JOB_COLUMNS: &str = "id, job_name, idempotency_key, payload, status, \
  attempts, max_attempts, available_at, leased_by, lease_expires_at, last_error, \
  created_at";

pub struct RawJob {
  pub id:               i64,
  pub job_name:         String,
  pub idempotency_key:  String,
  pub payload:          String,
  pub status:           String,
  pub attempts:         i64,
  pub max_attempts:     i64,
  pub available_at:     String,
  pub leased_by:        Option<String>,
  pub lease_expires_at: Option<String>,
  pub last_error:       Option<String>,
  pub created_at:       String,
}

impl RawJob {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:               row.get(0)?,
      job_name:         row.get(1)?,
      idempotency_key:  row.get(2)?,
      payload:          row.get(3)?,
      status:           row.get(4)?,
      attempts:         row.get(5)?,
      max_attempts:     row.get(6)?,
      available_at:     row.get(7)?,
      leased_by:        row.get(8)?,
      lease_expires_at: row.get(9)?,
      last_error:       row.get(10)?,
      created_at:       row.get(11)?,
    })
  }

  pub fn into_job(self) -> Result<Job> {
    Ok(Job {
      id:               JobId(self.id),
      job_name:         self.job_name,
      idempotency_key:  self.idempotency_key,
      kind:             serde_json::from_str(&self.payload)?,
      status:           decode_variant::<JobStatus>("job status", &self.status)?,
      attempts:         to_u32(self.attempts),
      max_attempts:     to_u32(self.max_attempts),
      available_at:     decode_dt(&self.available_at)?,
      leased_by:        self.leased_by,
      lease_expires_at: decode_opt_dt(self.lease_expires_at)?,
      last_error:       self.last_error,
      created_at:       decode_dt(&self.created_at)?,
    })
  }
}

pub const FAILED_JOB_COLUMNS: &str =
  "id, job_name, idempotency_key, payload, attempts, error_message, failed_at";

pub struct RawFailedJob {
  pub id:              i64,
  pub job_name:        String,
  pub idempotency_key: String,
  pub payload:         String,
  pub attempts:        i64,
  pub error_message:   String,
  pub failed_at:       String,
}

impl RawFailedJob {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:              row.get(0)?,
      job_name:        row.get(1)?,
      idempotency_key: row.get(2)?,
      payload:         row.get(3)?,
      attempts:        row.get(4)?,
      error_message:   row.get(5)?,
      failed_at:       row.get(6)?,
    })
  }

  pub fn into_failed_job(self) -> Result<FailedJob> {
    Ok(FailedJob {
      id:              JobId(self.id),
      job_name:        self.job_name,
      idempotency_key: self.idempotency_key,
      payload:         self.payload,
      attempts:        to_u32(self.attempts),
      error_message:   self.error_message,
      failed_at:       decode_dt(&self.failed_at)?,
    })
  }
}
