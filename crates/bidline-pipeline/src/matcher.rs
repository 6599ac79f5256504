//! Score one revision against every active subscription.

use std::sync::Arc;

use bidline_core::{
  matching::{self, MatchConfig, MatchResult},
  store::TenderStore,
  tender::RevisionId,
};
use chrono::Utc;
use tracing::info;

use crate::{PipelineError, Result};

pub struct Matcher<S> {
  store:  Arc<S>,
  config: MatchConfig,
}

impl<S: TenderStore> Matcher<S> {
  pub fn new(store: Arc<S>, config: MatchConfig) -> Self { Self { store, config } }

  /// Evaluate and upsert one result per active subscription, ranked.
  pub async fn evaluate_revision(&self, revision_id: RevisionId) -> Result<Vec<MatchResult>> {
    let revision = self
      .store
      .get_revision(revision_id)
      .await
      .map_err(PipelineError::store)?
      .ok_or(PipelineError::RevisionNotFound(revision_id))?;
    let tender = revision
      .normalized_payload
      .as_ref()
      .ok_or(PipelineError::NotNormalized(revision_id))?;

    let subscriptions = self
      .store
      .list_active_subscriptions()
      .await
      .map_err(PipelineError::store)?;

    let now = Utc::now();
    let today = now.date_naive();
    let mut results = Vec::with_capacity(subscriptions.len());
    for subscription in &subscriptions {
      let evaluation = matching::evaluate(tender, subscription, &self.config, today);
      let result = MatchResult::from_evaluation(subscription.id, revision_id, evaluation, now);
      self
        .store
        .upsert_match(result.clone())
        .await
        .map_err(PipelineError::store)?;
      results.push(result);
    }
    matching::rank(&mut results);

    info!(
      revision_id = %revision_id,
      evaluated = results.len(),
      matched = results.iter().filter(|r| r.is_match).count(),
      "revision matched"
    );
    Ok(results)
  }
}
