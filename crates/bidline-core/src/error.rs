//! Error types for `bidline-core`.

use thiserror::Error;

use crate::delivery::DeliveryState;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown {kind} value: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  #[error("cannot {action} a delivery in state {from}")]
  InvalidTransition {
    from:   DeliveryState,
    action: &'static str,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
