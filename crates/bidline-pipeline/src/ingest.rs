//! Ingestion: normalize an observation, detect change, append to the ledger.

use std::sync::Arc;

use bidline_core::{
  change::{self, ChangeDecision},
  jobs::JobKind,
  store::TenderStore,
  tender::{
    NewRevision, Normalization, RevisionStatus, RevisionOutcome, TenderId, TenderKey,
    TenderRevision,
  },
};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{PipelineError, Result, source::RawObservation, submit_job};

/// What one call to [`Ingestor::ingest`] did.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
  /// Same canonical content as the current revision.
  NoOp { tender_id: TenderId },
  Created {
    revision:       TenderRevision,
    became_current: bool,
  },
  /// Normalization failed for a known tender; a FAILED revision was recorded.
  Failed { revision: TenderRevision },
}

pub struct Ingestor<S> {
  store:            Arc<S>,
  model_version:    String,
  job_max_attempts: u32,
}

impl<S: TenderStore> Ingestor<S> {
  pub fn new(store: Arc<S>, model_version: impl Into<String>, job_max_attempts: u32) -> Self {
    Self {
      store,
      model_version: model_version.into(),
      job_max_attempts,
    }
  }

  pub async fn ingest(&self, observation: RawObservation) -> Result<IngestOutcome> {
    let key = TenderKey::new(&observation.source, &observation.tender_id);
    let (normalization, normalize_error) =
      match bidline_normalize::normalize(&observation.source, &observation.raw_payload) {
        Ok(tender) => (Normalization::Success(tender), None),
        Err(e) => (
          Normalization::Failed {
            error: e.to_string(),
          },
          Some(e),
        ),
      };
    let input = NewRevision::new(
      key.clone(),
      observation.raw_payload,
      normalization,
      observation.observed_at,
    );

    let head = self
      .store
      .tender_head(key.clone())
      .await
      .map_err(PipelineError::store)?;

    match (&head, normalize_error) {
      // Nothing to attach a FAILED revision to.
      (None, Some(e)) => return Err(e.into()),
      (Some(head), None) => {
        if let Some(hash) = input.normalized_content_hash.as_deref()
          && change::detect(head.latest_normalized_content_hash.as_deref(), hash)
            == ChangeDecision::NoOp
        {
          self
            .store
            .touch_tender(head.id, input.observed_at)
            .await
            .map_err(PipelineError::store)?;
          debug!(tender = %key, "content unchanged");
          return Ok(IngestOutcome::NoOp { tender_id: head.id });
        }
      }
      _ => {}
    }

    let outcome = self
      .store
      .append_revision(input)
      .await
      .map_err(PipelineError::store)?;

    let (revision, became_current) = match outcome {
      RevisionOutcome::NoOp { tender_id } => {
        debug!(tender = %key, "duplicate revision");
        return Ok(IngestOutcome::NoOp { tender_id });
      }
      RevisionOutcome::Created {
        revision,
        became_current,
      } => (revision, became_current),
    };

    if revision.revision_status == RevisionStatus::Failed {
      warn!(
        tender = %key,
        revision_id = %revision.id,
        error = revision.error_message.as_deref().unwrap_or_default(),
        "normalization failed; recorded FAILED revision"
      );
      return Ok(IngestOutcome::Failed { revision });
    }

    info!(
      tender = %key,
      revision_id = %revision.id,
      revision_number = revision.revision_number,
      became_current,
      changed = ?revision.changed_fields,
      "revision created"
    );

    let now = Utc::now();
    submit_job(
      self.store.as_ref(),
      JobKind::Index {
        revision_id:   revision.id,
        model_version: self.model_version.clone(),
      },
      self.job_max_attempts,
      now,
    )
    .await?;
    if became_current {
      submit_job(
        self.store.as_ref(),
        JobKind::Notify {
          revision_id: revision.id,
        },
        self.job_max_attempts,
        now,
      )
      .await?;
    }

    Ok(IngestOutcome::Created {
      revision,
      became_current,
    })
  }
}
