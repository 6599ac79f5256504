//! Revision-scoped search artifacts.
//!
//! Index rows always belong to exactly one revision; a new revision gets its
//! own document and chunks and never inherits another revision's rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  hash,
  tender::{NormalizedTender, RevisionId, TenderId},
};

// ─── Documents ───────────────────────────────────────────────────────────────

/// Fielded tender-level document for keyword and facet queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
  pub revision_id: RevisionId,
  pub tender_id:   TenderId,
  pub title:       String,
  pub agency:      Option<String>,
  pub region:      Option<String>,
  pub category:    Option<String>,
  pub deadline:    Option<NaiveDate>,
  pub budget:      Option<i64>,
  pub body:        String,
  pub created_at:  DateTime<Utc>,
}

impl IndexDocument {
  pub fn build(
    revision_id: RevisionId,
    tender_id: TenderId,
    tender: &NormalizedTender,
    created_at: DateTime<Utc>,
  ) -> Self {
    Self {
      revision_id,
      tender_id,
      title: tender.title.clone(),
      agency: tender.agency.clone(),
      region: tender.region.clone(),
      category: tender.category.clone(),
      deadline: tender.deadline,
      budget: tender.budget,
      body: document_body(tender),
      created_at,
    }
  }
}

/// Searchable text of a tender: title, then the descriptive fields one per
/// line.
pub fn document_body(tender: &NormalizedTender) -> String {
  [
    Some(tender.title.as_str()),
    tender.agency.as_deref(),
    tender.region.as_deref(),
    tender.category.as_deref(),
    tender.description.as_deref(),
  ]
  .into_iter()
  .flatten()
  .collect::<Vec<_>>()
  .join("\n")
}

/// Parameters for [`TenderStore::search_documents`](crate::store::TenderStore::search_documents).
///
/// Only the document of each tender's current revision is searched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentQuery {
  /// Free-text filter over title and body.
  pub text:     Option<String>,
  pub region:   Option<String>,
  pub category: Option<String>,
  /// Only tenders whose deadline is on or after this date (or unknown).
  pub open_on:  Option<NaiveDate>,
  pub limit:    Option<usize>,
}

// ─── Chunks ──────────────────────────────────────────────────────────────────

/// Passage-level retrieval row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexChunk {
  pub revision_id:   RevisionId,
  pub chunk_index:   usize,
  pub chunk_hash:    String,
  pub model_version: String,
  pub text:          String,
  pub embedding:     Vec<f32>,
  pub created_at:    DateTime<Utc>,
}

/// A chunk ready for embedding; `hash` is its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
  pub index: usize,
  pub hash:  String,
  pub text:  String,
}

/// Split `text` into chunks for one model version.
pub fn plan_chunks(
  text: &str,
  model_version: &str,
  max_chars: usize,
  overlap_words: usize,
) -> Vec<PlannedChunk> {
  chunk_text(text, max_chars, overlap_words)
    .into_iter()
    .enumerate()
    .map(|(index, text)| PlannedChunk {
      index,
      hash: hash::chunk_hash(model_version, index, &text),
      text,
    })
    .collect()
}

/// Word-boundary chunks of at most `max_chars` characters.
///
/// Consecutive chunks share up to `overlap_words` trailing words. A single
/// word longer than `max_chars` becomes its own chunk.
pub fn chunk_text(text: &str, max_chars: usize, overlap_words: usize) -> Vec<String> {
  let words: Vec<&str> = text.split_whitespace().collect();
  let max_chars = max_chars.max(1);
  let mut chunks = Vec::new();
  let mut start = 0;

  while start < words.len() {
    let mut end = start;
    let mut len = 0;
    while end < words.len() {
      let add = words[end].chars().count() + usize::from(end > start);
      if end > start && len + add > max_chars {
        break;
      }
      len += add;
      end += 1;
    }
    chunks.push(words[start..end].join(" "));
    if end >= words.len() {
      break;
    }
    // Always advance at least one word.
    start = end.saturating_sub(overlap_words).max(start + 1);
  }

  chunks
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
  if a.len() != b.len() || a.is_empty() {
    return 0.0;
  }
  let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
  let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
  let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
  if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
}

/// A chunk with its similarity to a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
  pub chunk: IndexChunk,
  pub score: f32,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunks_respect_limit_and_overlap() {
    let chunks = chunk_text("one two three four five six", 13, 1);
    assert_eq!(chunks, vec!["one two three", "three four", "four five six"]);
    assert!(chunks.iter().all(|c| c.chars().count() <= 13));
  }

  #[test]
  fn long_word_stands_alone() {
    let chunks = chunk_text("a incomprehensibilities b", 5, 0);
    assert_eq!(chunks, vec!["a", "incomprehensibilities", "b"]);
  }

  #[test]
  fn empty_text_has_no_chunks() {
    assert!(chunk_text("   ", 10, 2).is_empty());
  }

  #[test]
  fn planned_chunks_are_keyed_by_model() {
    let v1 = plan_chunks("alpha beta", "v1", 100, 0);
    let v2 = plan_chunks("alpha beta", "v2", 100, 0);
    assert_eq!(v1.len(), 1);
    assert_eq!(v1[0].text, v2[0].text);
    assert_ne!(v1[0].hash, v2[0].hash);
  }

  #[test]
  fn cosine_of_parallel_vectors_is_one() {
    let s = cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]);
    assert!((s - 1.0).abs() < 1e-6);
    assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
  }
}
