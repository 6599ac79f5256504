//! The revision ledger: `tenders`, `tender_revisions` and `raw_payloads`.
//!
//! Everything here runs inside a `tokio_rusqlite` call closure.

use bidline_core::{
  change::{self, ChangeDecision},
  hash,
  tender::{NewRevision, Normalization, NormalizedTender},
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior, params};

use crate::encode::{
  RawPayloadRow, RawRevision, RawTender, REVISION_COLUMNS, TENDER_COLUMNS, encode_dt,
};

pub(crate) enum Appended {
  NoOp(i64),
  Created {
    revision:       RawRevision,
    became_current: bool,
  },
  /// Failed normalization for a tender with no successful revision yet.
  UnknownTender,
}

fn other(e: impl std::error::Error + Send + Sync + 'static) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
  matches!(
    e,
    rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation
  )
}

/// Append one observation. See [`TenderStore::append_revision`].
///
/// The transaction is `IMMEDIATE` so the read of the tender pointer and the
/// write of the new revision observe the same state across processes.
///
/// [`TenderStore::append_revision`]: bidline_core::store::TenderStore::append_revision
pub(crate) fn append(
  conn: &mut Connection,
  input: NewRevision,
  now: DateTime<Utc>,
) -> tokio_rusqlite::Result<Appended> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let observed = encode_dt(input.observed_at);
  let normalized = input.normalization.normalized();

  let existing: Option<(i64, Option<i64>, Option<String>)> = tx
    .query_row(
      "SELECT id, current_revision_id, latest_normalized_content_hash
         FROM tenders WHERE source = ?1 AND tender_id = ?2",
      params![input.key.source, input.key.tender_id],
      |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()?;

  let (tender_pk, current_id, latest_hash) = match (existing, normalized) {
    (Some(found), _) => found,
    (None, None) => return Ok(Appended::UnknownTender),
    (None, Some(n)) => {
      tx.execute(
        "INSERT INTO tenders (source, tender_id, title, agency, status, first_seen_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
          input.key.source,
          input.key.tender_id,
          n.title,
          n.agency,
          n.status_on(input.observed_at.date_naive()).to_string(),
          observed,
        ],
      )?;
      (tx.last_insert_rowid(), None, None)
    }
  };

  // Re-check under the write lock: the caller's pre-check may be stale.
  if let Some(new_hash) = input.normalized_content_hash.as_deref()
    && change::detect(latest_hash.as_deref(), new_hash) == ChangeDecision::NoOp
  {
    touch(&tx, tender_pk, &observed)?;
    tx.commit()?;
    return Ok(Appended::NoOp(tender_pk));
  }

  let parent: Option<(String, Option<String>, String)> = match current_id {
    Some(id) => tx
      .query_row(
        "SELECT revision_hash, normalized_payload, observed_at
           FROM tender_revisions WHERE id = ?1",
        params![id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
      )
      .optional()?,
    None => None,
  };
  let parent_payload: Option<NormalizedTender> = parent
    .as_ref()
    .and_then(|(_, payload, _)| payload.as_deref())
    .map(serde_json::from_str)
    .transpose()
    .map_err(other)?;

  let revision_hash = hash::revision_hash(
    &input.raw_content_hash,
    input.normalized_content_hash.as_deref(),
    parent.as_ref().map(|(h, _, _)| h.as_str()),
  );
  let changed_fields = normalized
    .map(|n| change::changed_fields(parent_payload.as_ref(), n))
    .unwrap_or_default();
  let changed_json = serde_json::to_string(&changed_fields).map_err(other)?;
  let normalized_json = normalized
    .map(serde_json::to_string)
    .transpose()
    .map_err(other)?;
  let error_message = match &input.normalization {
    Normalization::Failed { error } => Some(error.clone()),
    Normalization::Success(_) => None,
  };

  let revision_number: i64 = tx.query_row(
    "SELECT COALESCE(MAX(revision_number), 0) + 1 FROM tender_revisions WHERE tender_pk = ?1",
    params![tender_pk],
    |r| r.get(0),
  )?;

  let inserted = tx.execute(
    "INSERT INTO tender_revisions (
       tender_pk, revision_number, revision_hash, raw_content_hash,
       normalized_content_hash, source_payload, normalized_payload,
       changed_fields, revision_status, error_message, observed_at, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    params![
      tender_pk,
      revision_number,
      revision_hash,
      input.raw_content_hash,
      input.normalized_content_hash,
      input.source_payload,
      normalized_json,
      changed_json,
      input.status().to_string(),
      error_message,
      observed,
      encode_dt(now),
    ],
  );

  // The one place a duplicate insert is translated into a no-op.
  if let Err(e) = inserted {
    if !is_constraint_violation(&e) {
      return Err(e.into());
    }
    let duplicate: Option<i64> = tx
      .query_row(
        "SELECT id FROM tender_revisions WHERE tender_pk = ?1 AND revision_hash = ?2",
        params![tender_pk, revision_hash],
        |r| r.get(0),
      )
      .optional()?;
    if duplicate.is_none() {
      return Err(e.into());
    }
    touch(&tx, tender_pk, &observed)?;
    tx.commit()?;
    return Ok(Appended::NoOp(tender_pk));
  }
  let revision_pk = tx.last_insert_rowid();

  tx.execute(
    "INSERT OR IGNORE INTO raw_payloads (tender_revision_pk, content_hash, payload, captured_at)
     VALUES (?1, ?2, ?3, ?4)",
    params![
      revision_pk,
      input.raw_content_hash,
      input.source_payload,
      encode_dt(now)
    ],
  )?;

  // Late-arriving observations are recorded but never regress the pointer.
  let not_older = parent
    .as_ref()
    .is_none_or(|(_, _, parent_observed)| observed.as_str() >= parent_observed.as_str());
  let became_current = match normalized {
    Some(n) if not_older => {
      tx.execute(
        "UPDATE tenders SET
           current_revision_id            = ?1,
           latest_raw_content_hash        = ?2,
           latest_normalized_content_hash = ?3,
           title                          = ?4,
           agency                         = ?5,
           status                         = ?6,
           last_seen_at                   = MAX(last_seen_at, ?7)
         WHERE id = ?8",
        params![
          revision_pk,
          input.raw_content_hash,
          input.normalized_content_hash,
          n.title,
          n.agency,
          n.status_on(input.observed_at.date_naive()).to_string(),
          observed,
          tender_pk,
        ],
      )?;
      true
    }
    _ => {
      touch(&tx, tender_pk, &observed)?;
      false
    }
  };

  let revision = tx.query_row(
    &format!("SELECT {REVISION_COLUMNS} FROM tender_revisions WHERE id = ?1"),
    params![revision_pk],
    RawRevision::from_row,
  )?;
  tx.commit()?;

  Ok(Appended::Created {
    revision,
    became_current,
  })
}

pub(crate) fn touch(conn: &Connection, tender_pk: i64, seen_at: &str) -> rusqlite::Result<()> {
  conn.execute(
    "UPDATE tenders SET last_seen_at = MAX(last_seen_at, ?1) WHERE id = ?2",
    params![seen_at, tender_pk],
  )?;
  Ok(())
}

pub(crate) fn head(
  conn: &Connection,
  source: &str,
  tender_id: &str,
) -> rusqlite::Result<Option<(i64, Option<i64>, Option<String>, Option<String>)>> {
  conn
    .query_row(
      "SELECT id, current_revision_id, latest_raw_content_hash, latest_normalized_content_hash
         FROM tenders WHERE source = ?1 AND tender_id = ?2",
      params![source, tender_id],
      |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )
    .optional()
}

pub(crate) fn tender_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<RawTender>> {
  conn
    .query_row(
      &format!("SELECT {TENDER_COLUMNS} FROM tenders WHERE id = ?1"),
      params![id],
      RawTender::from_row,
    )
    .optional()
}

pub(crate) fn tender_by_key(
  conn: &Connection,
  source: &str,
  tender_id: &str,
) -> rusqlite::Result<Option<RawTender>> {
  conn
    .query_row(
      &format!("SELECT {TENDER_COLUMNS} FROM tenders WHERE source = ?1 AND tender_id = ?2"),
      params![source, tender_id],
      RawTender::from_row,
    )
    .optional()
}

pub(crate) fn revision(conn: &Connection, id: i64) -> rusqlite::Result<Option<RawRevision>> {
  conn
    .query_row(
      &format!("SELECT {REVISION_COLUMNS} FROM tender_revisions WHERE id = ?1"),
      params![id],
      RawRevision::from_row,
    )
    .optional()
}

pub(crate) fn revisions(conn: &Connection, tender_pk: i64) -> rusqlite::Result<Vec<RawRevision>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {REVISION_COLUMNS} FROM tender_revisions
      WHERE tender_pk = ?1 ORDER BY revision_number"
  ))?;
  stmt
    .query_map(params![tender_pk], RawRevision::from_row)?
    .collect()
}

pub(crate) fn raw_payloads(
  conn: &Connection,
  revision_pk: i64,
) -> rusqlite::Result<Vec<RawPayloadRow>> {
  let mut stmt = conn.prepare(
    "SELECT tender_revision_pk, content_hash, payload, captured_at
       FROM raw_payloads WHERE tender_revision_pk = ?1 ORDER BY id",
  )?;
  stmt
    .query_map(params![revision_pk], RawPayloadRow::from_row)?
    .collect()
}
