//! Handlers for per-revision endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/revisions/:id/matches` | Ranked match results with explanations |
//! | `POST` | `/notify/revisions/:id` | Match and enqueue deliveries; idempotent |

use axum::{
  Json,
  extract::{Path, State},
};
use bidline_core::{matching::MatchResult, store::TenderStore, tender::RevisionId};
use bidline_pipeline::NotifyReport;

use crate::{AppState, error::ApiError};

/// `GET /revisions/:id/matches`
pub async fn matches<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<i64>,
) -> Result<Json<Vec<MatchResult>>, ApiError>
where
  S: TenderStore,
{
  let store = state.store();
  if store
    .get_revision(RevisionId(id))
    .await
    .map_err(ApiError::store)?
    .is_none()
  {
    return Err(ApiError::NotFound(format!("revision {id}")));
  }
  let results = store
    .list_matches(RevisionId(id))
    .await
    .map_err(ApiError::store)?;
  Ok(Json(results))
}

/// `POST /notify/revisions/:id`
pub async fn notify<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<i64>,
) -> Result<Json<NotifyReport>, ApiError>
where
  S: TenderStore,
{
  let report = state.pipeline.notify_revision(RevisionId(id)).await?;
  Ok(Json(report))
}
