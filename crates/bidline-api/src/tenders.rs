//! Handlers for `/tenders` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/tenders/:id` | Latest pointer; 404 if not found |
//! | `GET`  | `/tenders/:id/revisions` | Full history, oldest first |

use axum::{
  Json,
  extract::{Path, State},
};
use bidline_core::{
  store::TenderStore,
  tender::{Tender, TenderId, TenderRevision},
};

use crate::{AppState, error::ApiError};

/// `GET /tenders/:id`
pub async fn get_one<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<i64>,
) -> Result<Json<Tender>, ApiError>
where
  S: TenderStore,
{
  state
    .store()
    .get_tender(TenderId(id))
    .await
    .map_err(ApiError::store)?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("tender {id}")))
}

/// `GET /tenders/:id/revisions`
pub async fn revisions<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<i64>,
) -> Result<Json<Vec<TenderRevision>>, ApiError>
where
  S: TenderStore,
{
  let store = state.store();
  if store
    .get_tender(TenderId(id))
    .await
    .map_err(ApiError::store)?
    .is_none()
  {
    return Err(ApiError::NotFound(format!("tender {id}")));
  }
  let revisions = store
    .list_revisions(TenderId(id))
    .await
    .map_err(ApiError::store)?;
  Ok(Json(revisions))
}
