//! `ingestion_jobs` and the `failed_jobs` dead-letter table.

use bidline_core::jobs::{JobStatus, LEASE_EXPIRED, LeaseSweep, NewJob};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::encode::{FAILED_JOB_COLUMNS, JOB_COLUMNS, RawFailedJob, RawJob, encode_dt};

fn other(e: impl std::error::Error + Send + Sync + 'static) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e))
}

/// Insert-or-ignore on `(job_name, idempotency_key)`.
pub(crate) fn enqueue(
  conn: &Connection,
  input: &NewJob,
  now: DateTime<Utc>,
) -> tokio_rusqlite::Result<Option<RawJob>> {
  let payload = serde_json::to_string(&input.kind).map_err(other)?;
  let written = conn.execute(
    "INSERT INTO ingestion_jobs (
       job_name, idempotency_key, payload, status, attempts, max_attempts,
       available_at, created_at
     ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)
     ON CONFLICT (job_name, idempotency_key) DO NOTHING",
    params![
      input.kind.job_name(),
      input.idempotency_key,
      payload,
      JobStatus::Pending.to_string(),
      input.max_attempts,
      encode_dt(input.available_at),
      encode_dt(now),
    ],
  )?;
  if written == 0 {
    return Ok(None);
  }
  Ok(by_id(conn, conn.last_insert_rowid())?)
}

/// Conditionally move available jobs `pending → leased`.
pub(crate) fn lease(
  conn: &Connection,
  worker: &str,
  now: DateTime<Utc>,
  lease_until: DateTime<Utc>,
  limit: usize,
) -> rusqlite::Result<Vec<RawJob>> {
  let mut stmt = conn.prepare(&format!(
    "UPDATE ingestion_jobs
        SET status = 'leased', leased_by = ?1, lease_expires_at = ?2
      WHERE id IN (
              SELECT id FROM ingestion_jobs
               WHERE status = 'pending' AND available_at <= ?3
               ORDER BY available_at, id
               LIMIT ?4)
        AND status = 'pending'
      RETURNING {JOB_COLUMNS}"
  ))?;
  let mut rows: Vec<RawJob> = stmt
    .query_map(
      params![
        worker,
        encode_dt(lease_until),
        encode_dt(now),
        i64::try_from(limit).unwrap_or(i64::MAX)
      ],
      RawJob::from_row,
    )?
    .collect::<rusqlite::Result<_>>()?;
  rows.sort_by_key(|r| r.id);
  Ok(rows)
}

pub(crate) fn complete(conn: &Connection, id: i64) -> rusqlite::Result<()> {
  conn.execute(
    "UPDATE ingestion_jobs
        SET status = 'completed', leased_by = NULL, lease_expires_at = NULL
      WHERE id = ?1",
    params![id],
  )?;
  Ok(())
}

pub(crate) fn reschedule(
  conn: &Connection,
  id: i64,
  available_at: DateTime<Utc>,
  error: &str,
) -> rusqlite::Result<()> {
  conn.execute(
    "UPDATE ingestion_jobs
        SET status = 'pending', attempts = attempts + 1, available_at = ?1,
            last_error = ?2, leased_by = NULL, lease_expires_at = NULL
      WHERE id = ?3",
    params![encode_dt(available_at), error, id],
  )?;
  Ok(())
}

/// Move a job to `failed_jobs` in one transaction.
pub(crate) fn dead_letter(
  conn: &mut Connection,
  id: i64,
  error: &str,
  at: DateTime<Utc>,
) -> rusqlite::Result<Option<RawFailedJob>> {
  let tx = conn.transaction()?;
  let Some(job) = by_id(&tx, id)? else {
    return Ok(None);
  };
  tx.execute(
    "INSERT INTO failed_jobs (job_name, idempotency_key, payload, attempts, error_message, failed_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    params![
      job.job_name,
      job.idempotency_key,
      job.payload,
      job.attempts + 1,
      error,
      encode_dt(at),
    ],
  )?;
  let failed_pk = tx.last_insert_rowid();
  tx.execute("DELETE FROM ingestion_jobs WHERE id = ?1", params![id])?;
  let failed = failed_by_id(&tx, failed_pk)?;
  tx.commit()?;
  Ok(failed)
}

/// Leases whose holder never reported back cost one attempt. Jobs still
/// under budget return to `pending`; exhausted ones are dead-lettered in the
/// same transaction.
pub(crate) fn recover_expired(
  conn: &mut Connection,
  now: DateTime<Utc>,
) -> rusqlite::Result<LeaseSweep> {
  let now = encode_dt(now);
  let tx = conn.transaction()?;
  let dead_lettered = tx.execute(
    "INSERT INTO failed_jobs (job_name, idempotency_key, payload, attempts, error_message, failed_at)
     SELECT job_name, idempotency_key, payload, attempts + 1, ?2, ?1
       FROM ingestion_jobs
      WHERE status = 'leased' AND lease_expires_at < ?1 AND attempts + 1 >= max_attempts
      ORDER BY id",
    params![now, LEASE_EXPIRED],
  )?;
  tx.execute(
    "DELETE FROM ingestion_jobs
      WHERE status = 'leased' AND lease_expires_at < ?1 AND attempts + 1 >= max_attempts",
    params![now],
  )?;
  let requeued = tx.execute(
    "UPDATE ingestion_jobs
        SET status = 'pending', attempts = attempts + 1, last_error = ?2,
            leased_by = NULL, lease_expires_at = NULL
      WHERE status = 'leased' AND lease_expires_at < ?1",
    params![now, LEASE_EXPIRED],
  )?;
  tx.commit()?;
  Ok(LeaseSweep {
    requeued,
    dead_lettered,
  })
}

pub(crate) fn by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<RawJob>> {
  conn
    .query_row(
      &format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = ?1"),
      params![id],
      RawJob::from_row,
    )
    .optional()
}

fn failed_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<RawFailedJob>> {
  conn
    .query_row(
      &format!("SELECT {FAILED_JOB_COLUMNS} FROM failed_jobs WHERE id = ?1"),
      params![id],
      RawFailedJob::from_row,
    )
    .optional()
}

pub(crate) fn failed(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<RawFailedJob>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {FAILED_JOB_COLUMNS} FROM failed_jobs ORDER BY failed_at DESC, id DESC LIMIT ?1"
  ))?;
  stmt
    .query_map(
      params![i64::try_from(limit).unwrap_or(i64::MAX)],
      RawFailedJob::from_row,
    )?
    .collect()
}

/// Replay a dead letter: delete it and re-insert the job with a fresh budget.
pub(crate) fn requeue_failed(
  conn: &mut Connection,
  id: i64,
  max_attempts: u32,
  now: DateTime<Utc>,
) -> rusqlite::Result<Option<RawJob>> {
  let tx = conn.transaction()?;
  let Some(failed) = failed_by_id(&tx, id)? else {
    return Ok(None);
  };
  let now = encode_dt(now);
  tx.execute(
    "INSERT INTO ingestion_jobs (
       job_name, idempotency_key, payload, status, attempts, max_attempts,
       available_at, created_at
     ) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)
     ON CONFLICT (job_name, idempotency_key) DO UPDATE SET
       status = 'pending', attempts = 0, max_attempts = excluded.max_attempts,
       available_at = excluded.available_at, leased_by = NULL, lease_expires_at = NULL",
    params![failed.job_name, failed.idempotency_key, failed.payload, max_attempts, now],
  )?;
  let job_pk: i64 = tx.query_row(
    "SELECT id FROM ingestion_jobs WHERE job_name = ?1 AND idempotency_key = ?2",
    params![failed.job_name, failed.idempotency_key],
    |r| r.get(0),
  )?;
  tx.execute("DELETE FROM failed_jobs WHERE id = ?1", params![id])?;
  let job = by_id(&tx, job_pk)?;
  tx.commit()?;
  Ok(job)
}
