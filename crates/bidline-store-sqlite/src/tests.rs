//! Integration tests for `SqliteStore` against an in-memory database.

use bidline_core::{
  delivery::{DeliveryFailure, DeliveryMachine, DeliveryStatus, NewDelivery},
  index::{DocumentQuery, IndexChunk, IndexDocument},
  jobs::{EnqueueOutcome, JobKind, JobStatus, LEASE_EXPIRED, LeaseSweep, NewJob},
  matching::{self, MatchConfig, MatchResult},
  retry::{BackoffPolicy, FailureClass},
  store::TenderStore,
  subscription::{Criteria, NewSubscription, ProfileFields},
  tender::{
    FieldName, NewRevision, NormalizedTender, Normalization, RevisionOutcome,
    RevisionStatus, TenderKey, TenderRevision,
  },
};
use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone as _, Utc};

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

fn key() -> TenderKey { TenderKey::new("narajangter", "2024-001") }

fn tender(deadline: (i32, u32, u32)) -> NormalizedTender {
  NormalizedTender {
    title:       "Road resurfacing, district 4".into(),
    agency:      Some("Seoul Metropolitan Government".into()),
    deadline:    NaiveDate::from_ymd_opt(deadline.0, deadline.1, deadline.2),
    budget:      Some(120_000_000),
    region:      Some("Seoul".into()),
    category:    Some("construction".into()),
    urls:        vec!["https://example.test/bids/2024-001".into()],
    description: Some("Resurface 4km of arterial road.".into()),
  }
}

fn observation(n: NormalizedTender, observed_at: DateTime<Utc>) -> NewRevision {
  let raw = format!("{{\"title\":{:?},\"deadline\":{:?}}}", n.title, n.deadline);
  NewRevision::new(key(), raw, Normalization::Success(n), observed_at)
}

fn failed_observation(raw: &str, observed_at: DateTime<Utc>) -> NewRevision {
  NewRevision::new(
    key(),
    raw.into(),
    Normalization::Failed {
      error: "missing field: title".into(),
    },
    observed_at,
  )
}

fn created(outcome: RevisionOutcome) -> (TenderRevision, bool) {
  match outcome {
    RevisionOutcome::Created {
      revision,
      became_current,
    } => (revision, became_current),
    RevisionOutcome::NoOp { .. } => panic!("expected a new revision"),
  }
}

async fn seed_revision(s: &SqliteStore) -> TenderRevision {
  let (rev, _) = created(
    s.append_revision(observation(tender((2024, 5, 1)), at(1, 9)))
      .await
      .unwrap(),
  );
  rev
}

async fn seed_subscription(s: &SqliteStore) -> bidline_core::subscription::Subscription {
  s.insert_subscription(NewSubscription {
    user_ref:       "user-1".into(),
    name:           "Seoul roads".into(),
    channels:       vec!["webhook".into()],
    criteria:       Criteria::default(),
    profile_fields: ProfileFields::default(),
  })
  .await
  .unwrap()
}

// ─── Revision ledger ─────────────────────────────────────────────────────────

#[tokio::test]
async fn first_observation_creates_tender_and_revision() {
  let s = store().await;
  let (rev, became_current) = created(
    s.append_revision(observation(tender((2024, 5, 1)), at(1, 9)))
      .await
      .unwrap(),
  );

  assert!(became_current);
  assert_eq!(rev.revision_number, 1);
  assert_eq!(rev.revision_status, RevisionStatus::Success);
  assert_eq!(rev.changed_fields.len(), 8);

  let found = s.find_tender(key()).await.unwrap().unwrap();
  assert_eq!(found.current_revision_id, Some(rev.id));
  assert_eq!(found.latest_normalized_content_hash, rev.normalized_content_hash);
  assert_eq!(found.first_seen_at, at(1, 9));
}

#[tokio::test]
async fn replaying_identical_content_is_a_noop() {
  let s = store().await;
  let rev = seed_revision(&s).await;

  let outcome = s
    .append_revision(observation(tender((2024, 5, 1)), at(2, 9)))
    .await
    .unwrap();
  assert!(matches!(outcome, RevisionOutcome::NoOp { tender_id } if tender_id == rev.tender_id));

  let revisions = s.list_revisions(rev.tender_id).await.unwrap();
  assert_eq!(revisions.len(), 1);
  assert_eq!(s.list_raw_payloads(rev.id).await.unwrap().len(), 1);

  let found = s.get_tender(rev.tender_id).await.unwrap().unwrap();
  assert_eq!(found.last_seen_at, at(2, 9));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_observations_create_one_revision() {
  let s = store().await;
  let tasks: Vec<_> = (0..16u32)
    .map(|i| {
      let s = s.clone();
      tokio::spawn(async move {
        s.append_revision(observation(tender((2024, 5, 1)), at(1, 9) + TimeDelta::seconds(i.into())))
          .await
      })
    })
    .collect();

  let mut created_count = 0;
  for task in tasks {
    match task.await.unwrap().unwrap() {
      RevisionOutcome::Created { .. } => created_count += 1,
      RevisionOutcome::NoOp { .. } => {}
    }
  }
  assert_eq!(created_count, 1);

  let found = s.find_tender(key()).await.unwrap().unwrap();
  let revisions = s.list_revisions(found.id).await.unwrap();
  assert_eq!(revisions.len(), 1);
  assert_eq!(found.current_revision_id, Some(revisions[0].id));
}

#[tokio::test]
async fn deadline_change_appends_revision_and_moves_pointer() {
  let s = store().await;
  let first = seed_revision(&s).await;

  let (second, became_current) = created(
    s.append_revision(observation(tender((2024, 5, 15)), at(2, 9)))
      .await
      .unwrap(),
  );

  assert!(became_current);
  assert_eq!(second.revision_number, 2);
  assert_eq!(
    second.changed_fields.iter().copied().collect::<Vec<_>>(),
    vec![FieldName::Deadline]
  );
  assert_ne!(second.revision_hash, first.revision_hash);

  let head = s.tender_head(key()).await.unwrap().unwrap();
  assert_eq!(head.current_revision_id, Some(second.id));

  // The older revision is untouched.
  let old = s.get_revision(first.id).await.unwrap().unwrap();
  assert_eq!(old.normalized_payload, first.normalized_payload);
}

#[tokio::test]
async fn reverted_content_creates_a_new_revision() {
  let s = store().await;
  seed_revision(&s).await;
  s.append_revision(observation(tender((2024, 5, 15)), at(2, 9)))
    .await
    .unwrap();

  let (third, became_current) = created(
    s.append_revision(observation(tender((2024, 5, 1)), at(3, 9)))
      .await
      .unwrap(),
  );
  assert!(became_current);
  assert_eq!(third.revision_number, 3);
}

#[tokio::test]
async fn failed_normalization_keeps_pointer() {
  let s = store().await;
  let good = seed_revision(&s).await;

  let (failed, became_current) = created(
    s.append_revision(failed_observation("{\"broken\": true}", at(2, 9)))
      .await
      .unwrap(),
  );
  assert!(!became_current);
  assert_eq!(failed.revision_status, RevisionStatus::Failed);
  assert_eq!(failed.error_message.as_deref(), Some("missing field: title"));
  assert!(failed.normalized_payload.is_none());

  let head = s.tender_head(key()).await.unwrap().unwrap();
  assert_eq!(head.current_revision_id, Some(good.id));

  // The same broken payload again dedupes.
  let again = s
    .append_revision(failed_observation("{\"broken\": true}", at(3, 9)))
    .await
    .unwrap();
  assert!(matches!(again, RevisionOutcome::NoOp { .. }));
}

#[tokio::test]
async fn failed_normalization_for_unknown_tender_errors() {
  let s = store().await;
  let err = s
    .append_revision(failed_observation("{}", at(1, 9)))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::UnknownTender(k) if k == "narajangter/2024-001"));
  assert!(s.find_tender(key()).await.unwrap().is_none());
}

#[tokio::test]
async fn late_observation_does_not_regress_pointer() {
  let s = store().await;
  seed_revision(&s).await;
  let (newer, _) = created(
    s.append_revision(observation(tender((2024, 5, 15)), at(5, 9)))
      .await
      .unwrap(),
  );

  let (late, became_current) = created(
    s.append_revision(observation(tender((2024, 5, 10)), at(3, 9)))
      .await
      .unwrap(),
  );
  assert!(!became_current);
  assert_eq!(late.revision_number, 3);

  let found = s.find_tender(key()).await.unwrap().unwrap();
  assert_eq!(found.current_revision_id, Some(newer.id));
  assert_eq!(found.last_seen_at, at(5, 9));
}

// ─── Index artifacts ─────────────────────────────────────────────────────────

fn chunk(rev: &TenderRevision, index: usize, model: &str) -> IndexChunk {
  IndexChunk {
    revision_id:   rev.id,
    chunk_index:   index,
    chunk_hash:    bidline_core::hash::chunk_hash(model, index, "text"),
    model_version: model.into(),
    text:          format!("chunk {index}"),
    embedding:     vec![0.5, -0.25, 1.0],
    created_at:    at(1, 10),
  }
}

#[tokio::test]
async fn index_document_is_written_once_per_revision() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let doc = IndexDocument::build(
    rev.id,
    rev.tender_id,
    rev.normalized_payload.as_ref().unwrap(),
    at(1, 10),
  );

  assert!(s.insert_index_document(doc.clone()).await.unwrap());
  assert!(!s.insert_index_document(doc.clone()).await.unwrap());
  assert_eq!(s.get_index_document(rev.id).await.unwrap(), Some(doc));
}

#[tokio::test]
async fn chunks_are_scoped_to_revision_and_model() {
  let s = store().await;
  let first = seed_revision(&s).await;
  let (second, _) = created(
    s.append_revision(observation(tender((2024, 5, 15)), at(2, 9)))
      .await
      .unwrap(),
  );

  let written = s
    .insert_index_chunks(vec![chunk(&first, 0, "v1"), chunk(&first, 1, "v1")])
    .await
    .unwrap();
  assert_eq!(written, 2);

  // A rerun for the same revision writes nothing new.
  let rerun = s
    .insert_index_chunks(vec![chunk(&first, 0, "v1")])
    .await
    .unwrap();
  assert_eq!(rerun, 0);

  s.insert_index_chunks(vec![chunk(&second, 0, "v1"), chunk(&second, 0, "v2")])
    .await
    .unwrap();

  assert_eq!(s.list_index_chunks(first.id).await.unwrap().len(), 2);
  assert_eq!(s.chunk_hashes(second.id).await.unwrap().len(), 2);

  let current = s.current_chunks("v1".into()).await.unwrap();
  assert_eq!(current.len(), 1);
  assert_eq!(current[0].revision_id, second.id);
  assert_eq!(current[0].embedding, vec![0.5, -0.25, 1.0]);
}

#[tokio::test]
async fn search_matches_current_revision_only() {
  let s = store().await;
  let first = seed_revision(&s).await;
  let mut changed = tender((2024, 5, 15));
  changed.title = "Bridge inspection, district 4".into();
  let (second, _) = created(
    s.append_revision(observation(changed.clone(), at(2, 9)))
      .await
      .unwrap(),
  );

  for (rev, n) in [(&first, tender((2024, 5, 1))), (&second, changed)] {
    s.insert_index_document(IndexDocument::build(rev.id, rev.tender_id, &n, at(2, 10)))
      .await
      .unwrap();
  }

  let road = s
    .search_documents(DocumentQuery {
      text: Some("resurfacing".into()),
      ..Default::default()
    })
    .await
    .unwrap();
  assert!(road.is_empty());

  let bridge = s
    .search_documents(DocumentQuery {
      text:   Some("bridge".into()),
      region: Some("seoul".into()),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(bridge.len(), 1);
  assert_eq!(bridge[0].revision_id, second.id);

  let closed = s
    .search_documents(DocumentQuery {
      open_on: NaiveDate::from_ymd_opt(2024, 6, 1),
      ..Default::default()
    })
    .await
    .unwrap();
  assert!(closed.is_empty());
}

// ─── Subscriptions & matches ─────────────────────────────────────────────────

#[tokio::test]
async fn subscriptions_roundtrip_criteria() {
  let s = store().await;
  let sub = seed_subscription(&s).await;
  assert!(sub.active);
  assert!(sub.criteria.require_open);

  let fetched = s.get_subscription(sub.id).await.unwrap().unwrap();
  assert_eq!(fetched.channels, vec!["webhook".to_string()]);
  assert_eq!(s.list_active_subscriptions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn match_upsert_is_idempotent() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let sub = seed_subscription(&s).await;
  let n = rev.normalized_payload.clone().unwrap();
  let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

  let eval = matching::evaluate(&n, &sub, &MatchConfig::default(), today);
  let result = MatchResult::from_evaluation(sub.id, rev.id, eval, at(1, 11));
  s.upsert_match(result.clone()).await.unwrap();
  s.upsert_match(result.clone()).await.unwrap();

  let matches = s.list_matches(rev.id).await.unwrap();
  assert_eq!(matches.len(), 1);
  assert_eq!(matches[0].fit_score, result.fit_score);
  assert_eq!(matches[0].explanation, result.explanation);
}

// ─── Delivery outbox ─────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_delivery_is_ignored() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let sub = seed_subscription(&s).await;
  let input = NewDelivery {
    subscription_id: sub.id,
    revision_id:     rev.id,
    channel:         "webhook".into(),
    max_attempts:    3,
    queued_at:       at(1, 12),
  };

  assert!(s.enqueue_delivery(input.clone()).await.unwrap().is_some());
  assert!(s.enqueue_delivery(input).await.unwrap().is_none());
  assert_eq!(s.list_deliveries(sub.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn claim_only_takes_due_rows_once() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let sub = seed_subscription(&s).await;
  s.enqueue_delivery(NewDelivery {
    subscription_id: sub.id,
    revision_id:     rev.id,
    channel:         "webhook".into(),
    max_attempts:    3,
    queued_at:       at(1, 12),
  })
  .await
  .unwrap();

  assert!(s.claim_due_deliveries(at(1, 11), 10).await.unwrap().is_empty());

  let claimed = s.claim_due_deliveries(at(1, 12), 10).await.unwrap();
  assert_eq!(claimed.len(), 1);
  assert_eq!(claimed[0].delivery_status, DeliveryStatus::Processing);

  assert!(s.claim_due_deliveries(at(1, 13), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_cycle_mutates_one_row() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let sub = seed_subscription(&s).await;
  let policy = BackoffPolicy::default();
  let log = s
    .enqueue_delivery(NewDelivery {
      subscription_id: sub.id,
      revision_id:     rev.id,
      channel:         "webhook".into(),
      max_attempts:    3,
      queued_at:       at(1, 12),
    })
    .await
    .unwrap()
    .unwrap();

  let claimed = s.claim_due_deliveries(at(1, 12), 10).await.unwrap();
  let machine = claimed[0]
    .machine()
    .fail(FailureClass::Transient, &policy, at(1, 12))
    .unwrap();
  s.record_delivery_failure(log.id, DeliveryFailure::from_machine(&machine, "503"))
    .await
    .unwrap();

  let retried = s.get_delivery(log.id).await.unwrap().unwrap();
  assert_eq!(retried.delivery_status, DeliveryStatus::Queued);
  assert_eq!(retried.attempt_count, 1);
  assert_eq!(retried.last_error.as_deref(), Some("503"));
  assert_eq!(retried.next_retry_at, at(1, 12) + policy.delay_for_attempt(1));

  let later = retried.next_retry_at;
  assert_eq!(s.claim_due_deliveries(later, 10).await.unwrap().len(), 1);
  s.mark_delivered(log.id, later).await.unwrap();

  let done = s.get_delivery(log.id).await.unwrap().unwrap();
  assert_eq!(done.delivery_status, DeliveryStatus::Delivered);
  assert_eq!(done.delivered_at, Some(later));
  assert_eq!(done.attempt_count, 1);
  assert_eq!(s.list_deliveries(sub.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_processing_rows_are_recovered() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let sub = seed_subscription(&s).await;
  s.enqueue_delivery(NewDelivery {
    subscription_id: sub.id,
    revision_id:     rev.id,
    channel:         "webhook".into(),
    max_attempts:    3,
    queued_at:       at(1, 12),
  })
  .await
  .unwrap();
  s.claim_due_deliveries(at(1, 12), 10).await.unwrap();

  assert_eq!(s.recover_stale_deliveries(at(1, 12)).await.unwrap(), 0);
  assert_eq!(s.recover_stale_deliveries(at(1, 13)).await.unwrap(), 1);
  assert_eq!(s.claim_due_deliveries(at(1, 13), 10).await.unwrap().len(), 1);
}

#[test]
fn terminal_failure_is_persisted_as_failed() {
  let m = DeliveryMachine::new(1, at(1, 12)).claim().unwrap();
  let m = m
    .fail(FailureClass::Transient, &BackoffPolicy::default(), at(1, 12))
    .unwrap();
  assert_eq!(DeliveryFailure::from_machine(&m, "boom").status, DeliveryStatus::Failed);
}

// ─── Job queue ───────────────────────────────────────────────────────────────

fn notify_job(revision: &TenderRevision, available_at: DateTime<Utc>) -> NewJob {
  NewJob::new(
    JobKind::Notify {
      revision_id: revision.id,
    },
    3,
    available_at,
  )
}

#[tokio::test]
async fn duplicate_job_is_reported() {
  let s = store().await;
  let rev = seed_revision(&s).await;

  let first = s.enqueue_job(notify_job(&rev, at(1, 9))).await.unwrap();
  assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
  let second = s.enqueue_job(notify_job(&rev, at(1, 9))).await.unwrap();
  assert!(matches!(second, EnqueueOutcome::Duplicate));
}

#[tokio::test]
async fn lease_reschedule_and_complete() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  s.enqueue_job(notify_job(&rev, at(1, 9))).await.unwrap();

  let leased = s
    .lease_jobs("w1".into(), at(1, 9), at(1, 10), 5)
    .await
    .unwrap();
  assert_eq!(leased.len(), 1);
  let job = &leased[0];
  assert_eq!(job.status, JobStatus::Leased);
  assert_eq!(job.leased_by.as_deref(), Some("w1"));
  assert_eq!(job.kind, JobKind::Notify { revision_id: rev.id });

  // Another worker sees nothing while the lease holds.
  assert!(
    s.lease_jobs("w2".into(), at(1, 9), at(1, 10), 5)
      .await
      .unwrap()
      .is_empty()
  );

  let retry_at = at(1, 9) + TimeDelta::seconds(30);
  s.reschedule_job(job.id, retry_at, "timeout".into()).await.unwrap();
  let pending = s.get_job(job.id).await.unwrap().unwrap();
  assert_eq!(pending.status, JobStatus::Pending);
  assert_eq!(pending.attempts, 1);
  assert_eq!(pending.available_at, retry_at);

  let again = s
    .lease_jobs("w2".into(), retry_at, at(1, 11), 5)
    .await
    .unwrap();
  assert_eq!(again.len(), 1);
  s.complete_job(job.id).await.unwrap();
  assert_eq!(
    s.get_job(job.id).await.unwrap().unwrap().status,
    JobStatus::Completed
  );
}

#[tokio::test]
async fn expired_leases_return_to_pending() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let EnqueueOutcome::Enqueued(job) = s.enqueue_job(notify_job(&rev, at(1, 9))).await.unwrap()
  else {
    panic!("expected enqueue");
  };
  s.lease_jobs("w1".into(), at(1, 9), at(1, 10), 5).await.unwrap();

  assert_eq!(s.recover_expired_leases(at(1, 10)).await.unwrap(), LeaseSweep::default());
  assert_eq!(
    s.recover_expired_leases(at(1, 11)).await.unwrap(),
    LeaseSweep { requeued: 1, dead_lettered: 0 }
  );

  let recovered = s.get_job(job.id).await.unwrap().unwrap();
  assert_eq!(recovered.status, JobStatus::Pending);
  assert_eq!(recovered.attempts, 1);
  assert_eq!(recovered.last_error.as_deref(), Some(LEASE_EXPIRED));
  assert_eq!(
    s.lease_jobs("w2".into(), at(1, 11), at(1, 12), 5)
      .await
      .unwrap()
      .len(),
    1
  );
}

#[tokio::test]
async fn repeatedly_expired_lease_is_dead_lettered() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let EnqueueOutcome::Enqueued(job) = s.enqueue_job(notify_job(&rev, at(1, 9))).await.unwrap()
  else {
    panic!("expected enqueue");
  };

  // Each worker takes the job and dies before reporting back.
  for hour in [9, 11] {
    let leased = s
      .lease_jobs("w1".into(), at(1, hour), at(1, hour + 1), 5)
      .await
      .unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(
      s.recover_expired_leases(at(1, hour + 2)).await.unwrap(),
      LeaseSweep { requeued: 1, dead_lettered: 0 }
    );
  }
  assert_eq!(s.get_job(job.id).await.unwrap().unwrap().attempts, 2);

  s.lease_jobs("w1".into(), at(1, 13), at(1, 14), 5).await.unwrap();
  assert_eq!(
    s.recover_expired_leases(at(1, 15)).await.unwrap(),
    LeaseSweep { requeued: 0, dead_lettered: 1 }
  );

  assert!(s.get_job(job.id).await.unwrap().is_none());
  let failed = s.list_failed_jobs(10).await.unwrap();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].job_name, "notify");
  assert_eq!(failed[0].attempts, 3);
  assert_eq!(failed[0].error_message, LEASE_EXPIRED);
  assert_eq!(failed[0].failed_at, at(1, 15));
  assert!(
    s.lease_jobs("w2".into(), at(1, 16), at(1, 17), 5)
      .await
      .unwrap()
      .is_empty()
  );
}

#[tokio::test]
async fn dead_letter_and_requeue() {
  let s = store().await;
  let rev = seed_revision(&s).await;
  let EnqueueOutcome::Enqueued(job) = s.enqueue_job(notify_job(&rev, at(1, 9))).await.unwrap()
  else {
    panic!("expected enqueue");
  };

  let failed = s
    .dead_letter_job(job.id, "subscription lookup failed".into(), at(1, 9))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(failed.job_name, "notify");
  assert_eq!(failed.attempts, 1);
  assert!(s.get_job(job.id).await.unwrap().is_none());
  assert_eq!(s.list_failed_jobs(10).await.unwrap().len(), 1);

  let replayed = s
    .requeue_failed_job(failed.id, 5, at(2, 9))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(replayed.status, JobStatus::Pending);
  assert_eq!(replayed.attempts, 0);
  assert_eq!(replayed.max_attempts, 5);
  assert_eq!(replayed.kind, JobKind::Notify { revision_id: rev.id });
  assert!(s.list_failed_jobs(10).await.unwrap().is_empty());

  assert!(s.requeue_failed_job(failed.id, 5, at(2, 9)).await.unwrap().is_none());
}
