//! `GET /subscriptions/:id/deliveries`: was this subscriber notified, and how
//! did each attempt go.

use axum::{
  Json,
  extract::{Path, State},
};
use bidline_core::{delivery::DeliveryLog, store::TenderStore, tender::SubscriptionId};

use crate::{AppState, error::ApiError};

pub async fn deliveries<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<i64>,
) -> Result<Json<Vec<DeliveryLog>>, ApiError>
where
  S: TenderStore,
{
  let store = state.store();
  if store
    .get_subscription(SubscriptionId(id))
    .await
    .map_err(ApiError::store)?
    .is_none()
  {
    return Err(ApiError::NotFound(format!("subscription {id}")));
  }
  let logs = store
    .list_deliveries(SubscriptionId(id))
    .await
    .map_err(ApiError::store)?;
  Ok(Json(logs))
}
