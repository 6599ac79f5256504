//! Error type for `bidline-pipeline`.

use std::time::Duration;

use bidline_core::{retry::FailureClass, tender::RevisionId};
use thiserror::Error;

use crate::notify::DeliveryError;

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("store error: {0}")]
  Store(Box<dyn std::error::Error + Send + Sync>),

  #[error("normalize error: {0}")]
  Normalize(#[from] bidline_normalize::Error),

  #[error(transparent)]
  Core(#[from] bidline_core::Error),

  #[error("source {adapter}: {message}")]
  Source {
    adapter: String,
    message: String,
    class:   FailureClass,
  },

  #[error("unknown source: {0}")]
  UnknownSource(String),

  #[error("embedding failed: {0}")]
  Embedding(String),

  #[error("{stage} timed out after {after:?}")]
  Timeout {
    stage: &'static str,
    after: Duration,
  },

  #[error("revision {0} not found")]
  RevisionNotFound(RevisionId),

  /// FAILED revisions have no normalized payload to index or match.
  #[error("revision {0} has no normalized payload")]
  NotNormalized(RevisionId),

  #[error(transparent)]
  Delivery(#[from] DeliveryError),
}

impl PipelineError {
  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(e))
  }

  /// Whether the job layer should retry or dead-letter.
  pub fn class(&self) -> FailureClass {
    match self {
      PipelineError::Store(_)
      | PipelineError::Embedding(_)
      | PipelineError::Timeout { .. } => FailureClass::Transient,
      PipelineError::Source { class, .. } => *class,
      PipelineError::Delivery(e) => e.class(),
      PipelineError::Normalize(_)
      | PipelineError::Core(_)
      | PipelineError::UnknownSource(_)
      | PipelineError::RevisionNotFound(_)
      | PipelineError::NotNormalized(_) => FailureClass::Permanent,
    }
  }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
