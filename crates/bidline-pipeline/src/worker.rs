//! The job worker: lease, dispatch, then complete, retry or dead-letter.
//!
//! Each tick first returns expired job leases and stale deliveries to the
//! queue, then leases a batch of due jobs, then drains due deliveries.

use std::{sync::Arc, time::Duration};

use bidline_core::{
  jobs::{self, Job, JobStep},
  retry::BackoffPolicy,
  store::TenderStore,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{Pipeline, PipelineError, Result, notify::RetryReport};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub poll_interval:  Duration,
  pub lease:          TimeDelta,
  pub batch_size:     usize,
  pub delivery_batch: usize,
  pub backoff:        BackoffPolicy,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      poll_interval:  Duration::from_secs(2),
      lease:          TimeDelta::minutes(5),
      batch_size:     10,
      delivery_batch: 10,
      backoff:        BackoffPolicy::default(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
  pub recovered_leases:     usize,
  pub recovered_deliveries: usize,
  pub leased:               usize,
  pub completed:            usize,
  pub retried:              usize,
  pub dead_lettered:        usize,
  pub deliveries:           RetryReport,
}

pub struct JobWorker<S> {
  pipeline:  Arc<Pipeline<S>>,
  worker_id: String,
  config:    WorkerConfig,
}

impl<S: TenderStore> JobWorker<S> {
  pub fn new(pipeline: Arc<Pipeline<S>>, config: WorkerConfig) -> Self {
    Self {
      pipeline,
      worker_id: format!("worker-{}", Uuid::new_v4()),
      config,
    }
  }

  pub fn worker_id(&self) -> &str { &self.worker_id }

  /// Run one sweep-lease-dispatch round at `now`.
  pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
    let store = self.pipeline.store.as_ref();
    let sweep = store
      .recover_expired_leases(now)
      .await
      .map_err(PipelineError::store)?;
    let mut report = TickReport {
      recovered_leases: sweep.requeued,
      dead_lettered: sweep.dead_lettered,
      recovered_deliveries: self.pipeline.notifier.recover_stale(now).await?,
      ..Default::default()
    };
    if sweep.requeued > 0 {
      warn!(recovered = sweep.requeued, "expired job leases returned to pending");
    }
    if sweep.dead_lettered > 0 {
      error!(count = sweep.dead_lettered, "expired job leases exhausted their attempts");
    }

    let leased = store
      .lease_jobs(
        self.worker_id.clone(),
        now,
        now + self.config.lease,
        self.config.batch_size,
      )
      .await
      .map_err(PipelineError::store)?;
    report.leased = leased.len();

    for job in leased {
      match self.pipeline.dispatch(&job.kind).await {
        Ok(()) => {
          store
            .complete_job(job.id)
            .await
            .map_err(PipelineError::store)?;
          info!(job_id = %job.id, job_name = %job.job_name, "job completed");
          report.completed += 1;
        }
        Err(e) => match self.fail(&job, &e, now).await? {
          JobStep::Retry { .. } => report.retried += 1,
          JobStep::DeadLetter => report.dead_lettered += 1,
        },
      }
    }

    report.deliveries = self
      .pipeline
      .notifier
      .process_due(now, self.config.delivery_batch)
      .await?;
    Ok(report)
  }

  /// Poll until `shutdown` flips to `true`.
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
    info!(worker_id = %self.worker_id, "worker started");
    loop {
      if *shutdown.borrow() {
        break;
      }
      if let Err(e) = self.tick(Utc::now()).await {
        error!(worker_id = %self.worker_id, error = %e, "worker tick failed");
      }
      tokio::select! {
        _ = tokio::time::sleep(self.config.poll_interval) => {}
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
        }
      }
    }
    info!(worker_id = %self.worker_id, "worker stopped");
  }

  async fn fail(&self, job: &Job, e: &PipelineError, now: DateTime<Utc>) -> Result<JobStep> {
    let store = self.pipeline.store.as_ref();
    let attempts = job.attempts.saturating_add(1);
    let step = jobs::next_step(attempts, job.max_attempts, e.class(), &self.config.backoff, now);
    match step {
      JobStep::Retry { available_at } => {
        warn!(
          job_id = %job.id,
          job_name = %job.job_name,
          attempts,
          %available_at,
          error = %e,
          "job failed; rescheduled"
        );
        store
          .reschedule_job(job.id, available_at, e.to_string())
          .await
          .map_err(PipelineError::store)?;
      }
      JobStep::DeadLetter => {
        error!(
          job_id = %job.id,
          job_name = %job.job_name,
          attempts,
          class = ?e.class(),
          error = %e,
          "job dead-lettered"
        );
        store
          .dead_letter_job(job.id, e.to_string(), now)
          .await
          .map_err(PipelineError::store)?;
      }
    }
    Ok(step)
  }
}
