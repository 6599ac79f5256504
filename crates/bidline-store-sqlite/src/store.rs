//! [`SqliteStore`], the SQLite implementation of [`TenderStore`].

use std::{collections::BTreeSet, path::Path};

use bidline_core::{
  delivery::{DeliveryFailure, DeliveryLog, NewDelivery},
  index::{DocumentQuery, IndexChunk, IndexDocument},
  jobs::{EnqueueOutcome, FailedJob, Job, LeaseSweep, NewJob},
  matching::{self, MatchResult},
  store::TenderStore,
  subscription::{NewSubscription, Subscription},
  tender::{
    DeliveryId, JobId, NewRevision, RawPayload, RevisionId, RevisionOutcome,
    SubscriptionId, Tender, TenderHead, TenderId, TenderKey, TenderRevision,
  },
};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, params};

use crate::{
  Error, Result,
  encode::{MATCH_COLUMNS, RawMatch, RawSubscription, SUBSCRIPTION_COLUMNS, encode_dt},
  index, ledger,
  ledger::Appended,
  outbox, queue,
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A bidline store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Each worker
/// process opens its own store.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open a fresh in-memory store.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── TenderStore impl ────────────────────────────────────────────────────────

impl TenderStore for SqliteStore {
  type Error = Error;

  // ── Revision ledger ─────────────────────────────────────────────────────

  async fn tender_head(&self, key: TenderKey) -> Result<Option<TenderHead>> {
    let head = self
      .conn
      .call(move |conn| Ok(ledger::head(conn, &key.source, &key.tender_id)?))
      .await?;
    Ok(head.map(|(id, current, raw, normalized)| TenderHead {
      id:                             TenderId(id),
      current_revision_id:            current.map(RevisionId),
      latest_raw_content_hash:        raw,
      latest_normalized_content_hash: normalized,
    }))
  }

  async fn append_revision(&self, input: NewRevision) -> Result<RevisionOutcome> {
    let key = input.key.to_string();
    let appended = self
      .conn
      .call(move |conn| ledger::append(conn, input, Utc::now()))
      .await?;
    match appended {
      Appended::NoOp(pk) => Ok(RevisionOutcome::NoOp {
        tender_id: TenderId(pk),
      }),
      Appended::Created {
        revision,
        became_current,
      } => Ok(RevisionOutcome::Created {
        revision: revision.into_revision()?,
        became_current,
      }),
      Appended::UnknownTender => Err(Error::UnknownTender(key)),
    }
  }

  async fn touch_tender(&self, id: TenderId, seen_at: DateTime<Utc>) -> Result<()> {
    let seen_at = encode_dt(seen_at);
    self
      .conn
      .call(move |conn| Ok(ledger::touch(conn, id.0, &seen_at)?))
      .await?;
    Ok(())
  }

  async fn get_tender(&self, id: TenderId) -> Result<Option<Tender>> {
    let raw = self
      .conn
      .call(move |conn| Ok(ledger::tender_by_id(conn, id.0)?))
      .await?;
    raw.map(|r| r.into_tender()).transpose()
  }

  async fn find_tender(&self, key: TenderKey) -> Result<Option<Tender>> {
    let raw = self
      .conn
      .call(move |conn| Ok(ledger::tender_by_key(conn, &key.source, &key.tender_id)?))
      .await?;
    raw.map(|r| r.into_tender()).transpose()
  }

  async fn get_revision(&self, id: RevisionId) -> Result<Option<TenderRevision>> {
    let raw = self
      .conn
      .call(move |conn| Ok(ledger::revision(conn, id.0)?))
      .await?;
    raw.map(|r| r.into_revision()).transpose()
  }

  async fn list_revisions(&self, tender: TenderId) -> Result<Vec<TenderRevision>> {
    let raws = self
      .conn
      .call(move |conn| Ok(ledger::revisions(conn, tender.0)?))
      .await?;
    raws.into_iter().map(|r| r.into_revision()).collect()
  }

  async fn list_raw_payloads(&self, revision: RevisionId) -> Result<Vec<RawPayload>> {
    let raws = self
      .conn
      .call(move |conn| Ok(ledger::raw_payloads(conn, revision.0)?))
      .await?;
    raws.into_iter().map(|r| r.into_payload()).collect()
  }

  // ── Index artifacts ─────────────────────────────────────────────────────

  async fn insert_index_document(&self, document: IndexDocument) -> Result<bool> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(index::insert_document(conn, &document)?))
        .await?,
    )
  }

  async fn get_index_document(&self, revision: RevisionId) -> Result<Option<IndexDocument>> {
    let raw = self
      .conn
      .call(move |conn| Ok(index::document(conn, revision.0)?))
      .await?;
    raw.map(|r| r.into_document()).transpose()
  }

  async fn chunk_hashes(&self, revision: RevisionId) -> Result<BTreeSet<String>> {
    let hashes = self
      .conn
      .call(move |conn| Ok(index::chunk_hashes(conn, revision.0)?))
      .await?;
    Ok(hashes.into_iter().collect())
  }

  async fn insert_index_chunks(&self, chunks: Vec<IndexChunk>) -> Result<usize> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(index::insert_chunks(conn, &chunks)?))
        .await?,
    )
  }

  async fn list_index_chunks(&self, revision: RevisionId) -> Result<Vec<IndexChunk>> {
    let raws = self
      .conn
      .call(move |conn| Ok(index::chunks(conn, revision.0)?))
      .await?;
    raws.into_iter().map(|r| r.into_chunk()).collect()
  }

  async fn current_chunks(&self, model_version: String) -> Result<Vec<IndexChunk>> {
    let raws = self
      .conn
      .call(move |conn| Ok(index::current_chunks(conn, &model_version)?))
      .await?;
    raws.into_iter().map(|r| r.into_chunk()).collect()
  }

  async fn search_documents(&self, query: DocumentQuery) -> Result<Vec<IndexDocument>> {
    let raws = self
      .conn
      .call(move |conn| Ok(index::search(conn, &query)?))
      .await?;
    raws.into_iter().map(|r| r.into_document()).collect()
  }

  // ── Subscriptions ───────────────────────────────────────────────────────

  async fn insert_subscription(&self, input: NewSubscription) -> Result<Subscription> {
    let channels = serde_json::to_string(&input.channels)?;
    let criteria = serde_json::to_string(&input.criteria)?;
    let profile = serde_json::to_string(&input.profile_fields)?;
    let now = encode_dt(Utc::now());

    let raw = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO subscriptions (user_ref, name, channels, criteria, profile_fields, active, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
          params![input.user_ref, input.name, channels, criteria, profile, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
          &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
          params![id],
          RawSubscription::from_row,
        )?)
      })
      .await?;
    raw.into_subscription()
  }

  async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"),
              params![id.0],
              RawSubscription::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(|r| r.into_subscription()).transpose()
  }

  async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>> {
    let raws: Vec<RawSubscription> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE active = 1 ORDER BY id"
        ))?;
        let rows = stmt
          .query_map([], RawSubscription::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(|r| r.into_subscription()).collect()
  }

  // ── Match results ───────────────────────────────────────────────────────

  async fn upsert_match(&self, result: MatchResult) -> Result<()> {
    let explanation = serde_json::to_string(&result.explanation)?;
    let evaluated_at = encode_dt(result.evaluated_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO match_results (
             subscription_pk, tender_revision_pk, fit_score, is_match,
             signal_count, explanation, evaluated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
           ON CONFLICT (subscription_pk, tender_revision_pk) DO UPDATE SET
             fit_score    = excluded.fit_score,
             is_match     = excluded.is_match,
             signal_count = excluded.signal_count,
             explanation  = excluded.explanation,
             evaluated_at = excluded.evaluated_at",
          params![
            result.subscription_id.0,
            result.revision_id.0,
            result.fit_score,
            result.is_match,
            result.signal_count,
            explanation,
            evaluated_at,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_matches(&self, revision: RevisionId) -> Result<Vec<MatchResult>> {
    let raws: Vec<RawMatch> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {MATCH_COLUMNS} FROM match_results WHERE tender_revision_pk = ?1"
        ))?;
        let rows = stmt
          .query_map(params![revision.0], RawMatch::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    let mut results = raws
      .into_iter()
      .map(|r| r.into_match())
      .collect::<Result<Vec<_>>>()?;
    matching::rank(&mut results);
    Ok(results)
  }

  // ── Delivery outbox ─────────────────────────────────────────────────────

  async fn enqueue_delivery(&self, input: NewDelivery) -> Result<Option<DeliveryLog>> {
    let raw = self
      .conn
      .call(move |conn| Ok(outbox::enqueue(conn, &input)?))
      .await?;
    raw.map(|r| r.into_delivery()).transpose()
  }

  async fn claim_due_deliveries(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<DeliveryLog>> {
    let raws = self
      .conn
      .call(move |conn| Ok(outbox::claim_due(conn, now, limit)?))
      .await?;
    raws.into_iter().map(|r| r.into_delivery()).collect()
  }

  async fn mark_delivered(&self, id: DeliveryId, at: DateTime<Utc>) -> Result<()> {
    self
      .conn
      .call(move |conn| Ok(outbox::mark_delivered(conn, id.0, at)?))
      .await?;
    Ok(())
  }

  async fn record_delivery_failure(
    &self,
    id: DeliveryId,
    failure: DeliveryFailure,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| Ok(outbox::record_failure(conn, id.0, &failure)?))
      .await?;
    Ok(())
  }

  async fn recover_stale_deliveries(&self, started_before: DateTime<Utc>) -> Result<usize> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(outbox::recover_stale(conn, started_before)?))
        .await?,
    )
  }

  async fn get_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryLog>> {
    let raw = self
      .conn
      .call(move |conn| Ok(outbox::by_id(conn, id.0)?))
      .await?;
    raw.map(|r| r.into_delivery()).transpose()
  }

  async fn list_deliveries(&self, subscription: SubscriptionId) -> Result<Vec<DeliveryLog>> {
    let raws = self
      .conn
      .call(move |conn| Ok(outbox::for_subscription(conn, subscription.0)?))
      .await?;
    raws.into_iter().map(|r| r.into_delivery()).collect()
  }

  // ── Job queue ───────────────────────────────────────────────────────────

  async fn enqueue_job(&self, input: NewJob) -> Result<EnqueueOutcome> {
    let raw = self
      .conn
      .call(move |conn| queue::enqueue(conn, &input, Utc::now()))
      .await?;
    match raw {
      Some(raw) => Ok(EnqueueOutcome::Enqueued(raw.into_job()?)),
      None => Ok(EnqueueOutcome::Duplicate),
    }
  }

  async fn lease_jobs(
    &self,
    worker: String,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Job>> {
    let raws = self
      .conn
      .call(move |conn| Ok(queue::lease(conn, &worker, now, lease_until, limit)?))
      .await?;
    raws.into_iter().map(|r| r.into_job()).collect()
  }

  async fn complete_job(&self, id: JobId) -> Result<()> {
    self
      .conn
      .call(move |conn| Ok(queue::complete(conn, id.0)?))
      .await?;
    Ok(())
  }

  async fn reschedule_job(
    &self,
    id: JobId,
    available_at: DateTime<Utc>,
    error: String,
  ) -> Result<()> {
    self
      .conn
      .call(move |conn| Ok(queue::reschedule(conn, id.0, available_at, &error)?))
      .await?;
    Ok(())
  }

  async fn dead_letter_job(
    &self,
    id: JobId,
    error: String,
    at: DateTime<Utc>,
  ) -> Result<Option<FailedJob>> {
    let raw = self
      .conn
      .call(move |conn| Ok(queue::dead_letter(conn, id.0, &error, at)?))
      .await?;
    raw.map(|r| r.into_failed_job()).transpose()
  }

  async fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<LeaseSweep> {
    Ok(
      self
        .conn
        .call(move |conn| Ok(queue::recover_expired(conn, now)?))
        .await?,
    )
  }

  async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
    let raw = self
      .conn
      .call(move |conn| Ok(queue::by_id(conn, id.0)?))
      .await?;
    raw.map(|r| r.into_job()).transpose()
  }

  async fn list_failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>> {
    let raws = self
      .conn
      .call(move |conn| Ok(queue::failed(conn, limit)?))
      .await?;
    raws.into_iter().map(|r| r.into_failed_job()).collect()
  }

  async fn requeue_failed_job(
    &self,
    id: JobId,
    max_attempts: u32,
    now: DateTime<Utc>,
  ) -> Result<Option<Job>> {
    let raw = self
      .conn
      .call(move |conn| Ok(queue::requeue_failed(conn, id.0, max_attempts, now)?))
      .await?;
    raw.map(|r| r.into_job()).transpose()
  }
}
