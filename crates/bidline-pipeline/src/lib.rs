//! Pipeline stages for bidline.
//!
//! Each stage is generic over a [`TenderStore`] and receives its clients
//! (HTTP, embedder, providers) through its constructor. Stages coordinate only
//! through the store: the ingestor enqueues `index` and `notify` jobs, the
//! [`JobWorker`](worker::JobWorker) leases and dispatches them, and the
//! notifier drains the delivery outbox.

pub mod error;
pub mod indexer;
pub mod ingest;
pub mod matcher;
pub mod notify;
pub mod source;
pub mod worker;

use std::sync::Arc;

use bidline_core::{
  jobs::{EnqueueOutcome, JobKind, NewJob},
  matching::MatchConfig,
  store::TenderStore,
  tender::RevisionId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

pub use error::{PipelineError, Result};

use crate::{
  indexer::{Embedder, Indexer, IndexerConfig},
  ingest::{IngestOutcome, Ingestor},
  matcher::Matcher,
  notify::{DeliveryProvider, EnqueueReport, Notifier, NotifierConfig},
  source::{RawObservation, SourceRegistry},
};

// ─── Pipeline ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// Model version used for index jobs the ingestor enqueues.
  pub model_version:    String,
  pub job_max_attempts: u32,
  pub indexer:          IndexerConfig,
  pub matching:         MatchConfig,
  pub notifier:         NotifierConfig,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      model_version:    "hash-v1".into(),
      job_max_attempts: 5,
      indexer:          IndexerConfig::default(),
      matching:         MatchConfig::default(),
      notifier:         NotifierConfig::default(),
    }
  }
}

/// All stages wired to one store.
pub struct Pipeline<S> {
  pub store:            Arc<S>,
  pub sources:          SourceRegistry,
  pub ingestor:         Ingestor<S>,
  pub indexer:          Indexer<S>,
  pub matcher:          Matcher<S>,
  pub notifier:         Notifier<S>,
  pub model_version:    String,
  pub job_max_attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
  pub evaluated:  usize,
  pub matched:    usize,
  pub queued:     usize,
  pub duplicates: usize,
}

impl<S: TenderStore> Pipeline<S> {
  pub fn new(
    store: Arc<S>,
    sources: SourceRegistry,
    embedder: Arc<dyn Embedder>,
    providers: Vec<(String, Arc<dyn DeliveryProvider>)>,
    config: PipelineConfig,
  ) -> Self {
    let notifier = providers
      .into_iter()
      .fold(Notifier::new(store.clone(), config.notifier), |n, (channel, p)| {
        n.with_provider(channel, p)
      });
    Self {
      ingestor: Ingestor::new(store.clone(), &config.model_version, config.job_max_attempts),
      indexer: Indexer::new(store.clone(), embedder, config.indexer),
      matcher: Matcher::new(store.clone(), config.matching),
      notifier,
      sources,
      store,
      model_version: config.model_version,
      job_max_attempts: config.job_max_attempts,
    }
  }

  /// Match one revision and enqueue deliveries for every match.
  pub async fn notify_revision(&self, revision_id: RevisionId) -> Result<NotifyReport> {
    let matches = self.matcher.evaluate_revision(revision_id).await?;
    let EnqueueReport { queued, duplicates } =
      self.notifier.enqueue_for_matches(&matches).await?;
    Ok(NotifyReport {
      evaluated: matches.len(),
      matched: matches.iter().filter(|m| m.is_match).count(),
      queued,
      duplicates,
    })
  }

  /// Run one job payload to completion.
  pub async fn dispatch(&self, kind: &JobKind) -> Result<()> {
    match kind {
      JobKind::Fetch {
        source, tender_id, ..
      } => {
        let observation = self.sources.get(source)?.fetch(tender_id).await?;
        submit_job(
          self.store.as_ref(),
          JobKind::Ingest {
            source:      observation.source,
            tender_id:   observation.tender_id,
            raw_payload: observation.raw_payload,
            observed_at: observation.observed_at,
          },
          self.job_max_attempts,
          Utc::now(),
        )
        .await?;
      }
      JobKind::Ingest {
        source,
        tender_id,
        raw_payload,
        observed_at,
      } => {
        self.ingest(RawObservation {
          source:      source.clone(),
          tender_id:   tender_id.clone(),
          raw_payload: raw_payload.clone(),
          observed_at: *observed_at,
        })
        .await?;
      }
      JobKind::Index {
        revision_id,
        model_version,
      } => {
        self.indexer.index(*revision_id, model_version).await?;
      }
      JobKind::Notify { revision_id } => {
        self.notify_revision(*revision_id).await?;
      }
    }
    Ok(())
  }

  pub async fn ingest(&self, observation: RawObservation) -> Result<IngestOutcome> {
    self.ingestor.ingest(observation).await
  }
}

/// Enqueue `kind`, treating an existing identical job as success.
pub async fn submit_job<S: TenderStore>(
  store: &S,
  kind: JobKind,
  max_attempts: u32,
  now: DateTime<Utc>,
) -> Result<bool> {
  let job_name = kind.job_name();
  match store
    .enqueue_job(NewJob::new(kind, max_attempts, now))
    .await
    .map_err(PipelineError::store)?
  {
    EnqueueOutcome::Enqueued(job) => {
      debug!(job_id = %job.id, job_name, key = %job.idempotency_key, "job enqueued");
      Ok(true)
    }
    EnqueueOutcome::Duplicate => {
      debug!(job_name, "job already enqueued");
      Ok(false)
    }
  }
}

#[cfg(test)]
mod tests;
