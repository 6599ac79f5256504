//! `delivery_logs`: the notification outbox.

use bidline_core::delivery::{DeliveryFailure, DeliveryStatus, NewDelivery};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::encode::{DELIVERY_COLUMNS, RawDelivery, encode_dt};

/// Insert-or-ignore on `(subscription_pk, channel, event_key)`: the single
/// dedup gate for notifications.
pub(crate) fn enqueue(conn: &Connection, input: &NewDelivery) -> rusqlite::Result<Option<RawDelivery>> {
  let queued_at = encode_dt(input.queued_at);
  let written = conn.execute(
    "INSERT INTO delivery_logs (
       subscription_pk, tender_revision_pk, channel, event_key, delivery_status,
       attempt_count, max_attempts, next_retry_at, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)
     ON CONFLICT (subscription_pk, channel, event_key) DO NOTHING",
    params![
      input.subscription_id.0,
      input.revision_id.0,
      input.channel,
      input.event_key(),
      DeliveryStatus::Queued.to_string(),
      input.max_attempts,
      queued_at,
    ],
  )?;
  if written == 0 {
    return Ok(None);
  }
  by_id(conn, conn.last_insert_rowid())
}

/// Conditionally move due rows `queued → processing`.
pub(crate) fn claim_due(
  conn: &Connection,
  now: DateTime<Utc>,
  limit: usize,
) -> rusqlite::Result<Vec<RawDelivery>> {
  let mut stmt = conn.prepare(&format!(
    "UPDATE delivery_logs
        SET delivery_status = 'processing', processing_started_at = ?1
      WHERE id IN (
              SELECT id FROM delivery_logs
               WHERE delivery_status = 'queued' AND next_retry_at <= ?1
               ORDER BY next_retry_at, id
               LIMIT ?2)
        AND delivery_status = 'queued'
      RETURNING {DELIVERY_COLUMNS}"
  ))?;
  let limit = i64::try_from(limit).unwrap_or(i64::MAX);
  let mut rows: Vec<RawDelivery> = stmt
    .query_map(params![encode_dt(now), limit], RawDelivery::from_row)?
    .collect::<rusqlite::Result<_>>()?;
  rows.sort_by_key(|r| r.id());
  Ok(rows)
}

pub(crate) fn mark_delivered(conn: &Connection, id: i64, at: DateTime<Utc>) -> rusqlite::Result<()> {
  conn.execute(
    "UPDATE delivery_logs
        SET delivery_status = 'delivered', delivered_at = ?1, last_error = NULL
      WHERE id = ?2 AND delivery_status = 'processing'",
    params![encode_dt(at), id],
  )?;
  Ok(())
}

pub(crate) fn record_failure(
  conn: &Connection,
  id: i64,
  failure: &DeliveryFailure,
) -> rusqlite::Result<()> {
  conn.execute(
    "UPDATE delivery_logs
        SET delivery_status = ?1, attempt_count = ?2, next_retry_at = ?3, last_error = ?4
      WHERE id = ?5 AND delivery_status = 'processing'",
    params![
      failure.status.to_string(),
      failure.attempt_count,
      encode_dt(failure.next_retry_at),
      failure.error,
      id,
    ],
  )?;
  Ok(())
}

/// Rows stuck in `processing` (worker died mid-send) go back to `queued`.
pub(crate) fn recover_stale(conn: &Connection, started_before: DateTime<Utc>) -> rusqlite::Result<usize> {
  conn.execute(
    "UPDATE delivery_logs
        SET delivery_status = 'queued', processing_started_at = NULL
      WHERE delivery_status = 'processing' AND processing_started_at < ?1",
    params![encode_dt(started_before)],
  )
}

pub(crate) fn by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<RawDelivery>> {
  conn
    .query_row(
      &format!("SELECT {DELIVERY_COLUMNS} FROM delivery_logs WHERE id = ?1"),
      params![id],
      RawDelivery::from_row,
    )
    .optional()
}

pub(crate) fn for_subscription(conn: &Connection, subscription_pk: i64) -> rusqlite::Result<Vec<RawDelivery>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {DELIVERY_COLUMNS} FROM delivery_logs WHERE subscription_pk = ?1 ORDER BY id"
  ))?;
  stmt.query_map(params![subscription_pk], RawDelivery::from_row)?.collect()
}
