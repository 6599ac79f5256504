//! JSON HTTP API for bidline.
//!
//! Exposes an axum [`Router`] over a [`Pipeline`] backed by any
//! [`TenderStore`]. TLS and end-user authentication are the caller's
//! responsibility; the operator endpoints check a bearer secret.
//!
//! # Mounting
//!
//! ```rust,ignore
//! let app = bidline_api::api_router(AppState::new(pipeline, cron_secret, 10));
//! ```

pub mod auth;
pub mod error;
pub mod operator;
pub mod reindex;
pub mod revisions;
pub mod search;
pub mod subscriptions;
pub mod tenders;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use bidline_core::store::TenderStore;
use bidline_pipeline::Pipeline;

pub use error::ApiError;

/// Shared state for every handler.
pub struct AppState<S> {
  pub pipeline:         Arc<Pipeline<S>>,
  pub cron_secret:      Option<Arc<str>>,
  /// Deliveries attempted per `POST /cron/retry`.
  pub retry_batch_size: usize,
}

impl<S> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self {
      pipeline:         self.pipeline.clone(),
      cron_secret:      self.cron_secret.clone(),
      retry_batch_size: self.retry_batch_size,
    }
  }
}

impl<S> AppState<S> {
  pub fn new(
    pipeline: Arc<Pipeline<S>>,
    cron_secret: Option<String>,
    retry_batch_size: usize,
  ) -> Self {
    Self {
      pipeline,
      cron_secret: cron_secret.map(Arc::from),
      retry_batch_size,
    }
  }

  fn store(&self) -> &S { self.pipeline.store.as_ref() }
}

/// Build the API router for `state`.
pub fn api_router<S>(state: AppState<S>) -> Router<()>
where
  S: TenderStore + 'static,
{
  Router::new()
    // Tenders
    .route("/tenders/{id}", get(tenders::get_one::<S>))
    .route("/tenders/{id}/revisions", get(tenders::revisions::<S>))
    // Revisions
    .route("/revisions/{id}/matches", get(revisions::matches::<S>))
    .route("/notify/revisions/{id}", post(revisions::notify::<S>))
    .route("/reindex", post(reindex::handler::<S>))
    // Subscriptions
    .route("/subscriptions/{id}/deliveries", get(subscriptions::deliveries::<S>))
    // Search
    .route("/search", get(search::documents::<S>))
    .route("/search/similar", get(search::similar::<S>))
    // Operator
    .route("/cron/retry", post(operator::retry::<S>))
    .route("/dead-letters", get(operator::dead_letters::<S>))
    .route("/dead-letters/{id}/requeue", post(operator::requeue::<S>))
    .with_state(state)
}
