//! Error type for `bidline-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("unknown {kind} value: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  /// A failed normalization for a tender that was never seen successfully.
  #[error("tender {0} has no successful revision to attach a failure to")]
  UnknownTender(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
