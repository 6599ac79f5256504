//! Operator endpoints. Every handler requires [`CronAuthorized`].
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/cron/retry` | Attempt one bounded batch of due deliveries |
//! | `GET`  | `/dead-letters` | Failed jobs, newest first; `?limit=` (default 50) |
//! | `POST` | `/dead-letters/:id/requeue` | Put a failed job back on the queue |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use bidline_core::{
  jobs::{FailedJob, Job},
  store::TenderStore,
  tender::JobId,
};
use bidline_pipeline::notify::RetryReport;
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::{AppState, auth::CronAuthorized, error::ApiError};

/// `POST /cron/retry`
pub async fn retry<S>(
  _auth: CronAuthorized,
  State(state): State<AppState<S>>,
) -> Result<Json<RetryReport>, ApiError>
where
  S: TenderStore + 'static,
{
  let notifier = &state.pipeline.notifier;
  let now = Utc::now();
  notifier.recover_stale(now).await?;
  let report = notifier.process_due(now, state.retry_batch_size).await?;
  info!(
    processed = report.processed,
    success = report.success,
    failed = report.failed,
    "cron retry batch"
  );
  Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
  pub limit: Option<usize>,
}

/// `GET /dead-letters`
pub async fn dead_letters<S>(
  _auth: CronAuthorized,
  State(state): State<AppState<S>>,
  Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<FailedJob>>, ApiError>
where
  S: TenderStore + 'static,
{
  let failed = state
    .store()
    .list_failed_jobs(query.limit.unwrap_or(50))
    .await
    .map_err(ApiError::store)?;
  Ok(Json(failed))
}

/// `POST /dead-letters/:id/requeue`
pub async fn requeue<S>(
  _auth: CronAuthorized,
  State(state): State<AppState<S>>,
  Path(id): Path<i64>,
) -> Result<Json<Job>, ApiError>
where
  S: TenderStore + 'static,
{
  let job = state
    .store()
    .requeue_failed_job(JobId(id), state.pipeline.job_max_attempts, Utc::now())
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("failed job {id}")))?;
  info!(job_id = %job.id, job_name = %job.job_name, "dead-lettered job requeued");
  Ok(Json(job))
}
