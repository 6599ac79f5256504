//! Error types for the bidline normalizer.

use bidline_core::tender::FieldName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("malformed payload: {0}")]
  Malformed(String),

  #[error("missing required field: {0}")]
  MissingField(FieldName),

  #[error("invalid {field}: {value:?}")]
  InvalidField { field: FieldName, value: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
