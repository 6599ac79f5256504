//! The `TenderStore` trait.
//!
//! Implemented by storage backends (e.g. `bidline-store-sqlite`). Pipeline
//! stages and the HTTP layer depend on this abstraction, never on a concrete
//! backend. All coordination between stages happens through the uniqueness
//! constraints and status columns behind these methods.

use std::{collections::BTreeSet, future::Future};

use chrono::{DateTime, Utc};

use crate::{
  delivery::{DeliveryFailure, DeliveryLog, NewDelivery},
  index::{DocumentQuery, IndexChunk, IndexDocument},
  jobs::{EnqueueOutcome, FailedJob, Job, LeaseSweep, NewJob},
  matching::MatchResult,
  subscription::{NewSubscription, Subscription},
  tender::{
    DeliveryId, JobId, NewRevision, RawPayload, RevisionId, RevisionOutcome,
    SubscriptionId, Tender, TenderHead, TenderId, TenderKey, TenderRevision,
  },
};

/// Abstraction over a bidline store backend.
///
/// All methods return `Send` futures so the trait can be used from
/// multi-threaded runtimes (tokio workers, `axum`).
pub trait TenderStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Revision ledger ───────────────────────────────────────────────────

  /// Pointer and latest hashes for `key`, `None` if never seen.
  fn tender_head(
    &self,
    key: TenderKey,
  ) -> impl Future<Output = Result<Option<TenderHead>, Self::Error>> + Send + '_;

  /// Append a revision for `input.key` in a single transaction.
  ///
  /// Creates the tender on its first successful normalization. Identical
  /// content and duplicate inserts racing on `(tender_pk, revision_hash)`
  /// both yield [`RevisionOutcome::NoOp`]. The tender pointer moves only for
  /// successful revisions not older than the current one.
  fn append_revision(
    &self,
    input: NewRevision,
  ) -> impl Future<Output = Result<RevisionOutcome, Self::Error>> + Send + '_;

  /// Refresh `last_seen_at` without writing a revision.
  fn touch_tender(
    &self,
    id: TenderId,
    seen_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn get_tender(
    &self,
    id: TenderId,
  ) -> impl Future<Output = Result<Option<Tender>, Self::Error>> + Send + '_;

  fn find_tender(
    &self,
    key: TenderKey,
  ) -> impl Future<Output = Result<Option<Tender>, Self::Error>> + Send + '_;

  fn get_revision(
    &self,
    id: RevisionId,
  ) -> impl Future<Output = Result<Option<TenderRevision>, Self::Error>> + Send + '_;

  /// All revisions of a tender ordered by `revision_number`.
  fn list_revisions(
    &self,
    tender: TenderId,
  ) -> impl Future<Output = Result<Vec<TenderRevision>, Self::Error>> + Send + '_;

  fn list_raw_payloads(
    &self,
    revision: RevisionId,
  ) -> impl Future<Output = Result<Vec<RawPayload>, Self::Error>> + Send + '_;

  // ── Index artifacts ───────────────────────────────────────────────────

  /// Insert-or-ignore the document of a revision. Returns `true` if written.
  fn insert_index_document(
    &self,
    document: IndexDocument,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn get_index_document(
    &self,
    revision: RevisionId,
  ) -> impl Future<Output = Result<Option<IndexDocument>, Self::Error>> + Send + '_;

  /// Chunk hashes already stored for a revision, across all model versions.
  fn chunk_hashes(
    &self,
    revision: RevisionId,
  ) -> impl Future<Output = Result<BTreeSet<String>, Self::Error>> + Send + '_;

  /// Insert-or-ignore chunk rows. Returns how many were written.
  fn insert_index_chunks(
    &self,
    chunks: Vec<IndexChunk>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  fn list_index_chunks(
    &self,
    revision: RevisionId,
  ) -> impl Future<Output = Result<Vec<IndexChunk>, Self::Error>> + Send + '_;

  /// Chunks of every tender's current revision for one model version.
  fn current_chunks(
    &self,
    model_version: String,
  ) -> impl Future<Output = Result<Vec<IndexChunk>, Self::Error>> + Send + '_;

  fn search_documents(
    &self,
    query: DocumentQuery,
  ) -> impl Future<Output = Result<Vec<IndexDocument>, Self::Error>> + Send + '_;

  // ── Subscriptions ─────────────────────────────────────────────────────

  fn insert_subscription(
    &self,
    input: NewSubscription,
  ) -> impl Future<Output = Result<Subscription, Self::Error>> + Send + '_;

  fn get_subscription(
    &self,
    id: SubscriptionId,
  ) -> impl Future<Output = Result<Option<Subscription>, Self::Error>> + Send + '_;

  fn list_active_subscriptions(
    &self,
  ) -> impl Future<Output = Result<Vec<Subscription>, Self::Error>> + Send + '_;

  // ── Match results ─────────────────────────────────────────────────────

  /// Insert or overwrite the result for `(subscription, revision)`.
  fn upsert_match(
    &self,
    result: MatchResult,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Results for a revision, ranked by fit score, signal count, then id.
  fn list_matches(
    &self,
    revision: RevisionId,
  ) -> impl Future<Output = Result<Vec<MatchResult>, Self::Error>> + Send + '_;

  // ── Delivery outbox ───────────────────────────────────────────────────

  /// Insert-or-ignore on `(subscription, channel, event_key)`. Returns the
  /// new row, or `None` if it already existed.
  fn enqueue_delivery(
    &self,
    input: NewDelivery,
  ) -> impl Future<Output = Result<Option<DeliveryLog>, Self::Error>> + Send + '_;

  /// Move up to `limit` due `queued` rows to `processing` and return them.
  ///
  /// The transition is conditional on the row still being `queued`, so two
  /// workers never claim the same row.
  fn claim_due_deliveries(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<DeliveryLog>, Self::Error>> + Send + '_;

  /// `processing → delivered`.
  fn mark_delivered(
    &self,
    id: DeliveryId,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// `processing → queued | failed` with the given attempt bookkeeping.
  fn record_delivery_failure(
    &self,
    id: DeliveryId,
    failure: DeliveryFailure,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Return `processing` rows claimed before `started_before` to `queued`.
  fn recover_stale_deliveries(
    &self,
    started_before: DateTime<Utc>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  fn get_delivery(
    &self,
    id: DeliveryId,
  ) -> impl Future<Output = Result<Option<DeliveryLog>, Self::Error>> + Send + '_;

  fn list_deliveries(
    &self,
    subscription: SubscriptionId,
  ) -> impl Future<Output = Result<Vec<DeliveryLog>, Self::Error>> + Send + '_;

  // ── Job queue ─────────────────────────────────────────────────────────

  fn enqueue_job(
    &self,
    input: NewJob,
  ) -> impl Future<Output = Result<EnqueueOutcome, Self::Error>> + Send + '_;

  /// Lease up to `limit` pending jobs available at `now` to `worker`.
  fn lease_jobs(
    &self,
    worker: String,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<Job>, Self::Error>> + Send + '_;

  fn complete_job(
    &self,
    id: JobId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Count a failed attempt and make the job available again at
  /// `available_at`.
  fn reschedule_job(
    &self,
    id: JobId,
    available_at: DateTime<Utc>,
    error: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Count a failed attempt and move the job to the dead-letter table.
  fn dead_letter_job(
    &self,
    id: JobId,
    error: String,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<FailedJob>, Self::Error>> + Send + '_;

  /// Count an attempt against every `leased` job whose lease expired before
  /// `now`. Jobs with budget left return to `pending`; the rest move to the
  /// dead-letter table.
  fn recover_expired_leases(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<LeaseSweep, Self::Error>> + Send + '_;

  fn get_job(
    &self,
    id: JobId,
  ) -> impl Future<Output = Result<Option<Job>, Self::Error>> + Send + '_;

  fn list_failed_jobs(
    &self,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<FailedJob>, Self::Error>> + Send + '_;

  /// Put a dead-lettered job back on the queue with a fresh attempt budget.
  fn requeue_failed_job(
    &self,
    id: JobId,
    max_attempts: u32,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<Job>, Self::Error>> + Send + '_;
}
