//! Bearer-token extractor for the operator endpoints.

use axum::{
  extract::FromRequestParts,
  http::{HeaderMap, header, request::Parts},
};
use bidline_core::store::TenderStore;

use crate::{AppState, error::ApiError};

/// Present in a handler means the request carried `Bearer <CRON_SECRET>`.
pub struct CronAuthorized;

/// Check the `Authorization` header against `secret`. No configured secret
/// rejects everything.
pub fn verify_bearer(headers: &HeaderMap, secret: Option<&str>) -> Result<(), ApiError> {
  let secret = secret.filter(|s| !s.is_empty()).ok_or(ApiError::Unauthorized)?;
  let token = headers
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .ok_or(ApiError::Unauthorized)?;

  if constant_time_eq(token.trim().as_bytes(), secret.as_bytes()) {
    Ok(())
  } else {
    Err(ApiError::Unauthorized)
  }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl<S> FromRequestParts<AppState<S>> for CronAuthorized
where
  S: TenderStore + 'static,
{
  type Rejection = ApiError;

  async fn from_request_parts(
    parts: &mut Parts,
    state: &AppState<S>,
  ) -> Result<Self, Self::Rejection> {
    verify_bearer(&parts.headers, state.cron_secret.as_deref())?;
    Ok(CronAuthorized)
  }
}
