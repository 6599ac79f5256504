//! `POST /reindex`: (re)build index artifacts for one revision or every
//! SUCCESS revision of one tender.
//!
//! The body names either `{ "tenderRevisionId": 7 }` or
//! `{ "source": "narajangter", "tenderId": "2024-001" }`, plus an optional
//! `modelVersion`. Artifacts that already exist are left untouched, so
//! repeating a call only reports `chunksExisting`.

use axum::{Json, extract::State};
use bidline_core::{
  store::TenderStore,
  tender::{RevisionId, TenderKey},
};
use bidline_pipeline::indexer::IndexResult;
use serde::{Deserialize, Serialize};

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexRequest {
  pub tender_revision_id: Option<i64>,
  pub source:             Option<String>,
  pub tender_id:          Option<String>,
  pub model_version:      Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexedRevision {
  pub revision_id:      RevisionId,
  pub document_created: bool,
  pub chunks_created:   usize,
  pub chunks_existing:  usize,
}

impl ReindexedRevision {
  fn new(revision_id: RevisionId, result: IndexResult) -> Self {
    Self {
      revision_id,
      document_created: result.document_created,
      chunks_created: result.chunks_created,
      chunks_existing: result.chunks_existing,
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexResponse {
  pub model_version: String,
  pub revisions:     Vec<ReindexedRevision>,
}

pub async fn handler<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<ReindexRequest>,
) -> Result<Json<ReindexResponse>, ApiError>
where
  S: TenderStore,
{
  let pipeline = &state.pipeline;
  let model_version = body
    .model_version
    .filter(|m| !m.trim().is_empty())
    .unwrap_or_else(|| pipeline.model_version.clone());

  let revisions = match (body.tender_revision_id, body.source, body.tender_id) {
    (Some(id), _, _) => {
      let result = pipeline.indexer.index(RevisionId(id), &model_version).await?;
      vec![ReindexedRevision::new(RevisionId(id), result)]
    }
    (None, Some(source), Some(tender_id)) => {
      let key = TenderKey::new(source, tender_id);
      if state
        .store()
        .find_tender(key.clone())
        .await
        .map_err(ApiError::store)?
        .is_none()
      {
        return Err(ApiError::NotFound(format!("tender {key}")));
      }
      pipeline
        .indexer
        .reindex_tender(key, &model_version)
        .await?
        .into_iter()
        .map(|(id, result)| ReindexedRevision::new(id, result))
        .collect()
    }
    _ => {
      return Err(ApiError::BadRequest(
        "expected tenderRevisionId or both source and tenderId".into(),
      ));
    }
  };

  Ok(Json(ReindexResponse {
    model_version,
    revisions,
  }))
}
