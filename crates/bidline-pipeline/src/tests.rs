//! End-to-end pipeline tests against an in-memory `SqliteStore`.

use std::sync::{
  Arc,
  atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bidline_core::{
  delivery::DeliveryStatus,
  jobs::{EnqueueOutcome, JobKind, JobStatus, NewJob},
  retry::{BackoffPolicy, FailureClass},
  store::TenderStore,
  subscription::{Criteria, NewSubscription, ProfileFields},
  tender::{FieldName, TenderKey, TenderRevision},
};
use bidline_store_sqlite::SqliteStore;
use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::{
  Pipeline, PipelineConfig, PipelineError,
  indexer::HashingEmbedder,
  ingest::IngestOutcome,
  notify::{DeliveryError, DeliveryProvider, Notification, NotifierConfig},
  source::{RawObservation, SourceAdapter, SourceRegistry},
  worker::{JobWorker, WorkerConfig},
};

// ─── Fixtures ────────────────────────────────────────────────────────────────

const SOURCE: &str = "narajangter";
const TENDER: &str = "2024-001";

fn payload(deadline: &str) -> String {
  format!(
    r#"{{"bidNtceNm": "Road resurfacing", "ntceInsttNm": "Seoul City",
        "bidClseDt": "{deadline}", "asignBdgtAmt": "120,000,000",
        "prtcptPsblRgnNm": "Seoul", "pubPrcrmntClsfcNm": "construction",
        "bidNtceDtl": "Resurface arterial roads in district four."}}"#
  )
}

fn observation(raw: impl Into<String>) -> RawObservation {
  RawObservation {
    source:      SOURCE.into(),
    tender_id:   TENDER.into(),
    raw_payload: raw.into(),
    observed_at: Utc::now(),
  }
}

/// Fails transiently `failures` times, then succeeds.
#[derive(Default)]
struct FlakyProvider {
  failures: AtomicUsize,
  calls:    AtomicUsize,
}

impl FlakyProvider {
  fn failing(times: usize) -> Self {
    Self {
      failures: AtomicUsize::new(times),
      calls:    AtomicUsize::new(0),
    }
  }
}

#[async_trait]
impl DeliveryProvider for FlakyProvider {
  async fn send(&self, _: &Notification) -> Result<(), DeliveryError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let left = self.failures.load(Ordering::SeqCst);
    if left > 0 {
      self.failures.store(left - 1, Ordering::SeqCst);
      return Err(DeliveryError::Transient("HTTP 503".into()));
    }
    Ok(())
  }
}

struct RejectingProvider;

#[async_trait]
impl DeliveryProvider for RejectingProvider {
  async fn send(&self, _: &Notification) -> Result<(), DeliveryError> {
    Err(DeliveryError::Permanent("HTTP 410".into()))
  }
}

/// Serves a fixed payload, or a transient error when `payload` is `None`.
struct StubSource {
  payload: Option<String>,
}

#[async_trait]
impl SourceAdapter for StubSource {
  fn name(&self) -> &str { SOURCE }

  async fn fetch(&self, tender_id: &str) -> crate::Result<RawObservation> {
    match &self.payload {
      Some(raw) => Ok(RawObservation {
        source:      SOURCE.into(),
        tender_id:   tender_id.into(),
        raw_payload: raw.clone(),
        observed_at: Utc::now(),
      }),
      None => Err(PipelineError::Source {
        adapter: SOURCE.into(),
        message: "HTTP 502".into(),
        class:   FailureClass::Transient,
      }),
    }
  }
}

async fn pipeline_with(
  provider: Arc<dyn DeliveryProvider>,
  source: StubSource,
) -> Arc<Pipeline<SqliteStore>> {
  let store = SqliteStore::open_in_memory().await.expect("in-memory store");
  pipeline_on(store, provider, source)
}

fn pipeline_on(
  store: SqliteStore,
  provider: Arc<dyn DeliveryProvider>,
  source: StubSource,
) -> Arc<Pipeline<SqliteStore>> {
  let store = Arc::new(store);
  let mut sources = SourceRegistry::new();
  sources.register(source);
  let config = PipelineConfig {
    notifier: NotifierConfig {
      max_attempts: 3,
      backoff: BackoffPolicy {
        base_secs: 1,
        max_secs:  60,
      },
      ..Default::default()
    },
    ..Default::default()
  };
  Arc::new(Pipeline::new(
    store,
    sources,
    Arc::new(HashingEmbedder::new(32)),
    vec![("webhook".into(), provider)],
    config,
  ))
}

async fn pipeline(provider: Arc<dyn DeliveryProvider>) -> Arc<Pipeline<SqliteStore>> {
  pipeline_with(
    provider,
    StubSource {
      payload: Some(payload("2099-12-31 18:00")),
    },
  )
  .await
}

async fn subscribe(p: &Pipeline<SqliteStore>) {
  p.store
    .insert_subscription(NewSubscription {
      user_ref:       "user-1".into(),
      name:           "Seoul construction".into(),
      channels:       vec!["webhook".into()],
      criteria:       Criteria::default(),
      profile_fields: ProfileFields::default(),
    })
    .await
    .unwrap();
}

async fn ingest_current(p: &Pipeline<SqliteStore>, raw: String) -> TenderRevision {
  match p.ingest(observation(raw)).await.unwrap() {
    IngestOutcome::Created {
      revision,
      became_current: true,
    } => revision,
    other => panic!("expected a current revision, got {other:?}"),
  }
}

fn worker(p: &Arc<Pipeline<SqliteStore>>) -> JobWorker<SqliteStore> {
  JobWorker::new(p.clone(), WorkerConfig::default())
}

// ─── Ingestion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn ingest_detects_noop_and_field_changes() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;

  let first = ingest_current(&p, payload("2099-12-31 18:00")).await;
  assert_eq!(first.revision_number, 1);

  let replay = p.ingest(observation(payload("2099-12-31 18:00"))).await.unwrap();
  assert!(matches!(replay, IngestOutcome::NoOp { tender_id } if tender_id == first.tender_id));

  let second = ingest_current(&p, payload("2100-01-15 18:00")).await;
  assert_eq!(second.revision_number, 2);
  assert_eq!(
    second.changed_fields.into_iter().collect::<Vec<_>>(),
    vec![FieldName::Deadline]
  );
}

#[tokio::test]
async fn new_current_revision_enqueues_index_and_notify() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  let rev = ingest_current(&p, payload("2099-12-31 18:00")).await;

  let now = Utc::now();
  let jobs = p
    .store
    .lease_jobs("inspector".into(), now, now + TimeDelta::minutes(1), 10)
    .await
    .unwrap();
  let kinds: Vec<JobKind> = jobs.into_iter().map(|j| j.kind).collect();
  assert_eq!(kinds.len(), 2);
  assert!(kinds.contains(&JobKind::Index {
    revision_id:   rev.id,
    model_version: "hash-v1".into(),
  }));
  assert!(kinds.contains(&JobKind::Notify { revision_id: rev.id }));
}

#[tokio::test]
async fn malformed_payload_for_unknown_tender_is_permanent() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;

  let err = p.ingest(observation("{not json")).await.unwrap_err();
  assert_eq!(err.class(), FailureClass::Permanent);
  assert!(
    p.store
      .find_tender(TenderKey::new(SOURCE, TENDER))
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn malformed_payload_for_known_tender_records_failed_revision() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  let good = ingest_current(&p, payload("2099-12-31 18:00")).await;

  let outcome = p.ingest(observation(r#"{"ntceInsttNm": "Seoul City"}"#)).await.unwrap();
  let IngestOutcome::Failed { revision } = outcome else {
    panic!("expected a FAILED revision");
  };
  assert_eq!(revision.revision_number, 2);

  let head = p
    .store
    .tender_head(TenderKey::new(SOURCE, TENDER))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(head.current_revision_id, Some(good.id));

  let err = p.indexer.index(revision.id, "hash-v1").await.unwrap_err();
  assert!(matches!(err, PipelineError::NotNormalized(id) if id == revision.id));
}

// ─── Indexing ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reindex_is_noop_and_model_versions_coexist() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  let rev = ingest_current(&p, payload("2099-12-31 18:00")).await;

  let first = p.indexer.index(rev.id, "hash-v1").await.unwrap();
  assert!(first.document_created);
  assert!(first.chunks_created > 0);

  let rerun = p.indexer.index(rev.id, "hash-v1").await.unwrap();
  assert!(!rerun.document_created);
  assert_eq!(rerun.chunks_created, 0);
  assert_eq!(rerun.chunks_existing, first.chunks_created);

  let v2 = p.indexer.index(rev.id, "hash-v2").await.unwrap();
  assert_eq!(v2.chunks_created, first.chunks_created);
  assert_eq!(
    p.store.list_index_chunks(rev.id).await.unwrap().len(),
    first.chunks_created * 2
  );

  let hits = p
    .indexer
    .similar_chunks("road resurfacing", "hash-v1", 3)
    .await
    .unwrap();
  assert!(!hits.is_empty());
  assert!(hits.iter().all(|h| h.chunk.revision_id == rev.id));
}

#[tokio::test]
async fn reindex_tender_covers_every_success_revision() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  ingest_current(&p, payload("2099-12-31 18:00")).await;
  ingest_current(&p, payload("2100-01-15 18:00")).await;

  let results = p
    .indexer
    .reindex_tender(TenderKey::new(SOURCE, TENDER), "hash-v1")
    .await
    .unwrap();
  assert_eq!(results.len(), 2);
  assert!(results.iter().all(|(_, r)| r.document_created));
}

// ─── Notification ────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_failure_retries_on_the_same_row() {
  let provider = Arc::new(FlakyProvider::failing(1));
  let p = pipeline(provider.clone()).await;
  subscribe(&p).await;
  let rev = ingest_current(&p, payload("2099-12-31 18:00")).await;

  let report = p.notify_revision(rev.id).await.unwrap();
  assert_eq!(report.matched, 1);
  assert_eq!(report.queued, 1);

  let again = p.notify_revision(rev.id).await.unwrap();
  assert_eq!(again.queued, 0);
  assert_eq!(again.duplicates, 1);

  let t0 = Utc::now();
  let first = p.notifier.process_due(t0, 10).await.unwrap();
  assert_eq!((first.processed, first.success, first.failed), (1, 0, 1));
  assert_eq!(first.errors.len(), 1);

  // Not due until the backoff elapses.
  assert_eq!(p.notifier.process_due(t0, 10).await.unwrap().processed, 0);

  let later = p
    .notifier
    .process_due(t0 + TimeDelta::hours(1), 10)
    .await
    .unwrap();
  assert_eq!(later.success, 1);

  let subscription = p.store.list_active_subscriptions().await.unwrap().remove(0);
  let logs = p.store.list_deliveries(subscription.id).await.unwrap();
  assert_eq!(logs.len(), 1);
  assert_eq!(logs[0].delivery_status, DeliveryStatus::Delivered);
  assert_eq!(logs[0].attempt_count, 1);
  assert!(logs[0].delivered_at.is_some());
  assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn permanent_failure_is_terminal() {
  let p = pipeline(Arc::new(RejectingProvider)).await;
  subscribe(&p).await;
  let rev = ingest_current(&p, payload("2099-12-31 18:00")).await;
  p.notify_revision(rev.id).await.unwrap();

  let t0 = Utc::now();
  let report = p.notifier.process_due(t0, 10).await.unwrap();
  assert_eq!(report.failed, 1);
  assert_eq!(
    p.notifier
      .process_due(t0 + TimeDelta::days(1), 10)
      .await
      .unwrap()
      .processed,
    0
  );

  let subscription = p.store.list_active_subscriptions().await.unwrap().remove(0);
  let logs = p.store.list_deliveries(subscription.id).await.unwrap();
  assert_eq!(logs[0].delivery_status, DeliveryStatus::Failed);
  assert_eq!(logs[0].attempt_count, 1);
  assert_eq!(logs[0].last_error.as_deref(), Some("permanent delivery failure: HTTP 410"));
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
  let p = pipeline(Arc::new(FlakyProvider::failing(10))).await;
  subscribe(&p).await;
  let rev = ingest_current(&p, payload("2099-12-31 18:00")).await;
  p.notify_revision(rev.id).await.unwrap();

  let t0 = Utc::now();
  for hour in 0..5 {
    p.notifier
      .process_due(t0 + TimeDelta::hours(hour), 10)
      .await
      .unwrap();
  }

  let subscription = p.store.list_active_subscriptions().await.unwrap().remove(0);
  let logs = p.store.list_deliveries(subscription.id).await.unwrap();
  assert_eq!(logs[0].delivery_status, DeliveryStatus::Failed);
  assert_eq!(logs[0].attempt_count, 3);
}

#[tokio::test]
async fn store_error_on_one_delivery_does_not_abort_the_batch() {
  let path = std::env::temp_dir().join(format!("bidline-{}.db", Uuid::new_v4()));
  let store = SqliteStore::open(&path).await.unwrap();
  let p = pipeline_on(
    store,
    Arc::new(FlakyProvider::default()),
    StubSource { payload: None },
  );
  for name in ["Seoul construction", "Roadworks"] {
    p.store
      .insert_subscription(NewSubscription {
        user_ref:       "user-1".into(),
        name:           name.into(),
        channels:       vec!["webhook".into()],
        criteria:       Criteria::default(),
        profile_fields: ProfileFields::default(),
      })
      .await
      .unwrap();
  }
  let rev = ingest_current(&p, payload("2099-12-31 18:00")).await;
  assert_eq!(p.notify_revision(rev.id).await.unwrap().queued, 2);

  // Refuse to persist the first row's success.
  rusqlite::Connection::open(&path)
    .unwrap()
    .execute_batch(
      "CREATE TRIGGER refuse_first_delivery
         BEFORE UPDATE OF delivery_status ON delivery_logs
         WHEN NEW.delivery_status = 'delivered'
          AND OLD.id = (SELECT MIN(id) FROM delivery_logs)
       BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .unwrap();

  let report = p.notifier.process_due(Utc::now(), 10).await.unwrap();
  assert_eq!((report.processed, report.success, report.failed), (2, 1, 1));
  assert_eq!(report.errors.len(), 1);

  let mut statuses = Vec::new();
  for subscription in p.store.list_active_subscriptions().await.unwrap() {
    for log in p.store.list_deliveries(subscription.id).await.unwrap() {
      statuses.push(log.delivery_status);
    }
  }
  statuses.sort_by_key(|s| s.to_string());
  assert_eq!(statuses, vec![DeliveryStatus::Delivered, DeliveryStatus::Processing]);

  let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn closed_tender_does_not_match() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  subscribe(&p).await;
  let rev = ingest_current(&p, payload("2001-01-01 18:00")).await;

  let report = p.notify_revision(rev.id).await.unwrap();
  assert_eq!(report.evaluated, 1);
  assert_eq!(report.matched, 0);
  assert_eq!(report.queued, 0);

  let matches = p.store.list_matches(rev.id).await.unwrap();
  assert_eq!(matches.len(), 1);
  assert_eq!(matches[0].fit_score, 0.0);
  assert!(matches[0].explanation.hard_filters.iter().any(|f| !f.passed));
}

// ─── Worker ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_runs_ingest_through_delivery() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  subscribe(&p).await;
  let w = worker(&p);

  p.store
    .enqueue_job(NewJob::new(
      JobKind::Fetch {
        source:       SOURCE.into(),
        tender_id:    TENDER.into(),
        requested_at: Utc::now(),
      },
      3,
      Utc::now(),
    ))
    .await
    .unwrap();

  // fetch → ingest → index + notify → delivery, one stage per tick.
  let mut delivered = 0;
  for _ in 0..5 {
    delivered += w.tick(Utc::now()).await.unwrap().deliveries.success;
  }
  assert_eq!(delivered, 1);

  let tender = p
    .store
    .find_tender(TenderKey::new(SOURCE, TENDER))
    .await
    .unwrap()
    .unwrap();
  let current = tender.current_revision_id.unwrap();
  assert!(p.store.get_index_document(current).await.unwrap().is_some());
  assert_eq!(p.store.list_matches(current).await.unwrap().len(), 1);
}

#[tokio::test]
async fn worker_reschedules_transient_failures() {
  let p = pipeline_with(
    Arc::new(FlakyProvider::default()),
    StubSource { payload: None },
  )
  .await;
  let w = worker(&p);

  let EnqueueOutcome::Enqueued(job) = p
    .store
    .enqueue_job(NewJob::new(
      JobKind::Fetch {
        source:       SOURCE.into(),
        tender_id:    TENDER.into(),
        requested_at: Utc::now(),
      },
      3,
      Utc::now(),
    ))
    .await
    .unwrap()
  else {
    panic!("expected enqueue");
  };

  let report = w.tick(Utc::now()).await.unwrap();
  assert_eq!(report.retried, 1);

  let job = p.store.get_job(job.id).await.unwrap().unwrap();
  assert_eq!(job.status, JobStatus::Pending);
  assert_eq!(job.attempts, 1);
  assert_eq!(job.last_error.as_deref(), Some("source narajangter: HTTP 502"));
  assert!(job.available_at > Utc::now());
}

#[tokio::test]
async fn worker_dead_letters_permanent_failures() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  let w = worker(&p);

  p.store
    .enqueue_job(NewJob::new(
      JobKind::Ingest {
        source:      SOURCE.into(),
        tender_id:   TENDER.into(),
        raw_payload: "{not json".into(),
        observed_at: Utc::now(),
      },
      3,
      Utc::now(),
    ))
    .await
    .unwrap();

  let report = w.tick(Utc::now()).await.unwrap();
  assert_eq!(report.dead_lettered, 1);

  let failed = p.store.list_failed_jobs(10).await.unwrap();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].job_name, "ingest");
  assert!(failed[0].error_message.starts_with("normalize error"));
}

#[tokio::test]
async fn worker_ingests_content_that_reverts() {
  let p = pipeline(Arc::new(FlakyProvider::default())).await;
  let w = worker(&p);
  let start = Utc::now();

  let deadlines = ["2099-12-31 18:00", "2100-01-15 18:00", "2099-12-31 18:00"];
  for (i, deadline) in deadlines.into_iter().enumerate() {
    let observed_at = start + TimeDelta::minutes(i as i64);
    let submitted = crate::submit_job(
      p.store.as_ref(),
      JobKind::Ingest {
        source:      SOURCE.into(),
        tender_id:   TENDER.into(),
        raw_payload: payload(deadline),
        observed_at,
      },
      3,
      observed_at,
    )
    .await
    .unwrap();
    assert!(submitted, "observation {i} was absorbed as a duplicate");
    w.tick(observed_at).await.unwrap();
  }

  let tender = p
    .store
    .find_tender(TenderKey::new(SOURCE, TENDER))
    .await
    .unwrap()
    .unwrap();
  let revisions = p.store.list_revisions(tender.id).await.unwrap();
  assert_eq!(revisions.len(), 3);

  let current = p
    .store
    .get_revision(tender.current_revision_id.unwrap())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(current.revision_number, 3);
  assert_eq!(
    current.normalized_content_hash,
    revisions[0].normalized_content_hash
  );
  assert_ne!(
    current.normalized_content_hash,
    revisions[1].normalized_content_hash
  );
}
