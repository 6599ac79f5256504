//! `index_documents` and `index_chunks`.
//!
//! Writes are insert-or-ignore on the revision-scoped unique keys, so a rerun
//! never touches rows of any other revision.

use bidline_core::index::{DocumentQuery, IndexChunk, IndexDocument};
use rusqlite::{Connection, OptionalExtension as _, params, params_from_iter, types::Value};

use crate::encode::{
  CHUNK_COLUMNS, DOCUMENT_COLUMNS, RawChunk, RawDocument, encode_date, encode_dt,
  encode_embedding,
};

const DEFAULT_SEARCH_LIMIT: usize = 50;

pub(crate) fn insert_document(conn: &Connection, doc: &IndexDocument) -> rusqlite::Result<bool> {
  let written = conn.execute(
    "INSERT OR IGNORE INTO index_documents (
       tender_revision_pk, tender_pk, title, agency, region, category,
       deadline, budget, body, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    params![
      doc.revision_id.0,
      doc.tender_id.0,
      doc.title,
      doc.agency,
      doc.region,
      doc.category,
      doc.deadline.map(encode_date),
      doc.budget,
      doc.body,
      encode_dt(doc.created_at),
    ],
  )?;
  Ok(written > 0)
}

pub(crate) fn document(conn: &Connection, revision_pk: i64) -> rusqlite::Result<Option<RawDocument>> {
  conn
    .query_row(
      &format!("SELECT {DOCUMENT_COLUMNS} FROM index_documents d WHERE d.tender_revision_pk = ?1"),
      params![revision_pk],
      RawDocument::from_row,
    )
    .optional()
}

pub(crate) fn chunk_hashes(conn: &Connection, revision_pk: i64) -> rusqlite::Result<Vec<String>> {
  let mut stmt =
    conn.prepare("SELECT chunk_hash FROM index_chunks WHERE tender_revision_pk = ?1")?;
  stmt.query_map(params![revision_pk], |r| r.get(0))?.collect()
}

pub(crate) fn insert_chunks(conn: &mut Connection, chunks: &[IndexChunk]) -> rusqlite::Result<usize> {
  let tx = conn.transaction()?;
  let mut written = 0;
  {
    let mut stmt = tx.prepare(
      "INSERT OR IGNORE INTO index_chunks (
         tender_revision_pk, chunk_index, chunk_hash, model_version, text, embedding, created_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for chunk in chunks {
      written += stmt.execute(params![
        chunk.revision_id.0,
        i64::try_from(chunk.chunk_index).unwrap_or(i64::MAX),
        chunk.chunk_hash,
        chunk.model_version,
        chunk.text,
        encode_embedding(&chunk.embedding),
        encode_dt(chunk.created_at),
      ])?;
    }
  }
  tx.commit()?;
  Ok(written)
}

pub(crate) fn chunks(conn: &Connection, revision_pk: i64) -> rusqlite::Result<Vec<RawChunk>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {CHUNK_COLUMNS} FROM index_chunks c
      WHERE c.tender_revision_pk = ?1 ORDER BY c.model_version, c.chunk_index"
  ))?;
  stmt.query_map(params![revision_pk], RawChunk::from_row)?.collect()
}

pub(crate) fn current_chunks(conn: &Connection, model_version: &str) -> rusqlite::Result<Vec<RawChunk>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {CHUNK_COLUMNS} FROM index_chunks c
       JOIN tenders t ON t.current_revision_id = c.tender_revision_pk
      WHERE c.model_version = ?1
      ORDER BY c.tender_revision_pk, c.chunk_index"
  ))?;
  stmt.query_map(params![model_version], RawChunk::from_row)?.collect()
}

/// Keyword and facet search over the current revision of every tender.
pub(crate) fn search(conn: &Connection, query: &DocumentQuery) -> rusqlite::Result<Vec<RawDocument>> {
  let mut sql = format!(
    "SELECT {DOCUMENT_COLUMNS} FROM index_documents d
       JOIN tenders t ON t.current_revision_id = d.tender_revision_pk
      WHERE 1 = 1"
  );
  let mut values: Vec<Value> = Vec::new();

  if let Some(text) = query.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
    values.push(Value::Text(format!("%{}%", escape_like(text))));
    let n = values.len();
    sql.push_str(&format!(
      " AND (d.title LIKE ?{n} ESCAPE '\\' OR d.body LIKE ?{n} ESCAPE '\\')"
    ));
  }
  if let Some(region) = &query.region {
    values.push(Value::Text(format!("%{}%", escape_like(region))));
    sql.push_str(&format!(" AND d.region LIKE ?{} ESCAPE '\\'", values.len()));
  }
  if let Some(category) = &query.category {
    values.push(Value::Text(format!("%{}%", escape_like(category))));
    sql.push_str(&format!(" AND d.category LIKE ?{} ESCAPE '\\'", values.len()));
  }
  if let Some(open_on) = query.open_on {
    values.push(Value::Text(encode_date(open_on)));
    sql.push_str(&format!(" AND (d.deadline IS NULL OR d.deadline >= ?{})", values.len()));
  }

  let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
  values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
  sql.push_str(&format!(
    " ORDER BY d.deadline IS NULL, d.deadline, d.tender_revision_pk LIMIT ?{}",
    values.len()
  ));

  let mut stmt = conn.prepare(&sql)?;
  stmt
    .query_map(params_from_iter(values), RawDocument::from_row)?
    .collect()
}

fn escape_like(s: &str) -> String {
  s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
