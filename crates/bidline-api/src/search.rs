//! Retrieval over the index artifacts of current revisions.
//!
//! | Method | Path | Query |
//! |--------|------|-------|
//! | `GET`  | `/search` | `q`, `region`, `category`, `open_on`, `limit` |
//! | `GET`  | `/search/similar` | `q` (required), `model_version`, `limit` |

use axum::{
  Json,
  extract::{Query, State},
};
use bidline_core::{
  index::{ChunkHit, DocumentQuery, IndexDocument},
  store::TenderStore,
};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::{AppState, error::ApiError};

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
  pub q:        Option<String>,
  pub region:   Option<String>,
  pub category: Option<String>,
  pub open_on:  Option<NaiveDate>,
  pub limit:    Option<usize>,
}

/// `GET /search`
pub async fn documents<S>(
  State(state): State<AppState<S>>,
  Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<IndexDocument>>, ApiError>
where
  S: TenderStore,
{
  let documents = state
    .store()
    .search_documents(DocumentQuery {
      text:     query.q.filter(|q| !q.trim().is_empty()),
      region:   query.region,
      category: query.category,
      open_on:  query.open_on,
      limit:    Some(query.limit.unwrap_or(20).min(100)),
    })
    .await
    .map_err(ApiError::store)?;
  Ok(Json(documents))
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
  pub q:             String,
  pub model_version: Option<String>,
  pub limit:         Option<usize>,
}

/// `GET /search/similar`
pub async fn similar<S>(
  State(state): State<AppState<S>>,
  Query(query): Query<SimilarQuery>,
) -> Result<Json<Vec<ChunkHit>>, ApiError>
where
  S: TenderStore,
{
  if query.q.trim().is_empty() {
    return Err(ApiError::BadRequest("q must not be empty".into()));
  }
  let pipeline = &state.pipeline;
  let model_version = query
    .model_version
    .unwrap_or_else(|| pipeline.model_version.clone());
  let hits = pipeline
    .indexer
    .similar_chunks(&query.q, &model_version, query.limit.unwrap_or(10).min(100))
    .await?;
  Ok(Json(hits))
}
