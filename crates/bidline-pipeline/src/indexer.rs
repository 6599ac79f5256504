//! Revision-scoped index artifacts: one document plus embedded chunks.
//!
//! Chunk rows are keyed by `(revision_id, chunk_hash)` and the chunk hash
//! folds in the model version, so rerunning a revision only embeds chunks
//! that are missing and a new model version adds rows alongside the old ones.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bidline_core::{
  index::{self, ChunkHit, IndexChunk, IndexDocument},
  store::TenderStore,
  tender::{RevisionId, RevisionStatus, TenderKey},
};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{PipelineError, Result};

// ─── Embedding ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait Embedder: Send + Sync {
  /// One vector per input text, in order.
  async fn embed(&self, model_version: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic feature hashing over lowercase word tokens.
///
/// Each token lands in one of `dims` buckets with a hashed sign; the result
/// is L2-normalized. The model version seeds the hash.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
  dims: usize,
}

impl HashingEmbedder {
  pub fn new(dims: usize) -> Self { Self { dims: dims.max(1) } }

  pub fn embed_one(&self, model_version: &str, text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; self.dims];
    for token in text
      .split(|c: char| !c.is_alphanumeric())
      .filter(|t| !t.is_empty())
    {
      let digest = Sha256::new()
        .chain_update(model_version.as_bytes())
        .chain_update([0u8])
        .chain_update(token.to_lowercase().as_bytes())
        .finalize();
      let mut bucket = [0u8; 8];
      bucket.copy_from_slice(&digest[..8]);
      let slot = usize::try_from(u64::from_le_bytes(bucket) % self.dims as u64).unwrap_or(0);
      let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
      v[slot] += sign;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
      v.iter_mut().for_each(|x| *x /= norm);
    }
    v
  }
}

#[async_trait]
impl Embedder for HashingEmbedder {
  async fn embed(&self, model_version: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    Ok(texts.iter().map(|t| self.embed_one(model_version, t)).collect())
  }
}

// ─── Indexer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IndexerConfig {
  pub chunk_chars:   usize,
  pub overlap_words: usize,
  pub timeout:       Duration,
}

impl Default for IndexerConfig {
  fn default() -> Self {
    Self {
      chunk_chars:   800,
      overlap_words: 8,
      timeout:       Duration::from_secs(30),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexResult {
  pub document_created: bool,
  pub chunks_created:   usize,
  pub chunks_existing:  usize,
}

pub struct Indexer<S> {
  store:    Arc<S>,
  embedder: Arc<dyn Embedder>,
  config:   IndexerConfig,
}

impl<S: TenderStore> Indexer<S> {
  pub fn new(store: Arc<S>, embedder: Arc<dyn Embedder>, config: IndexerConfig) -> Self {
    Self {
      store,
      embedder,
      config,
    }
  }

  /// Build the artifacts of one revision under `model_version`.
  pub async fn index(&self, revision_id: RevisionId, model_version: &str) -> Result<IndexResult> {
    let revision = self
      .store
      .get_revision(revision_id)
      .await
      .map_err(PipelineError::store)?
      .ok_or(PipelineError::RevisionNotFound(revision_id))?;
    let tender = revision
      .normalized_payload
      .as_ref()
      .filter(|_| revision.revision_status == RevisionStatus::Success)
      .ok_or(PipelineError::NotNormalized(revision_id))?;

    let now = Utc::now();
    let document = IndexDocument::build(revision.id, revision.tender_id, tender, now);
    let planned = index::plan_chunks(
      &document.body,
      model_version,
      self.config.chunk_chars,
      self.config.overlap_words,
    );
    let document_created = self
      .store
      .insert_index_document(document)
      .await
      .map_err(PipelineError::store)?;

    let existing = self
      .store
      .chunk_hashes(revision_id)
      .await
      .map_err(PipelineError::store)?;
    let missing: Vec<_> = planned
      .iter()
      .filter(|c| !existing.contains(&c.hash))
      .collect();
    let chunks_existing = planned.len() - missing.len();

    if missing.is_empty() {
      debug!(revision_id = %revision_id, model_version, "index up to date");
      return Ok(IndexResult {
        document_created,
        chunks_created: 0,
        chunks_existing,
      });
    }

    let texts: Vec<String> = missing.iter().map(|c| c.text.clone()).collect();
    let embeddings = self.embed(model_version, &texts).await?;

    let rows: Vec<IndexChunk> = missing
      .into_iter()
      .zip(embeddings)
      .map(|(c, embedding)| IndexChunk {
        revision_id,
        chunk_index: c.index,
        chunk_hash: c.hash.clone(),
        model_version: model_version.to_owned(),
        text: c.text.clone(),
        embedding,
        created_at: now,
      })
      .collect();
    let chunks_created = self
      .store
      .insert_index_chunks(rows)
      .await
      .map_err(PipelineError::store)?;

    info!(
      revision_id = %revision_id,
      model_version,
      document_created,
      chunks_created,
      chunks_existing,
      "revision indexed"
    );
    Ok(IndexResult {
      document_created,
      chunks_created,
      chunks_existing,
    })
  }

  /// Index every SUCCESS revision of one tender.
  pub async fn reindex_tender(
    &self,
    key: TenderKey,
    model_version: &str,
  ) -> Result<Vec<(RevisionId, IndexResult)>> {
    let Some(tender) = self
      .store
      .find_tender(key)
      .await
      .map_err(PipelineError::store)?
    else {
      return Ok(Vec::new());
    };
    let revisions = self
      .store
      .list_revisions(tender.id)
      .await
      .map_err(PipelineError::store)?;

    let mut results = Vec::new();
    for revision in revisions
      .iter()
      .filter(|r| r.revision_status == RevisionStatus::Success)
    {
      results.push((revision.id, self.index(revision.id, model_version).await?));
    }
    Ok(results)
  }

  /// Chunks of current revisions closest to `query` by cosine similarity.
  pub async fn similar_chunks(
    &self,
    query: &str,
    model_version: &str,
    limit: usize,
  ) -> Result<Vec<ChunkHit>> {
    let mut vectors = self.embed(model_version, &[query.to_owned()]).await?;
    let Some(query_vec) = vectors.pop() else {
      return Ok(Vec::new());
    };
    let chunks = self
      .store
      .current_chunks(model_version.to_owned())
      .await
      .map_err(PipelineError::store)?;

    let mut hits: Vec<ChunkHit> = chunks
      .into_iter()
      .map(|chunk| ChunkHit {
        score: index::cosine_similarity(&query_vec, &chunk.embedding),
        chunk,
      })
      .collect();
    hits.sort_by(|a, b| {
      b.score
        .total_cmp(&a.score)
        .then(a.chunk.revision_id.cmp(&b.chunk.revision_id))
        .then(a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });
    hits.truncate(limit);
    Ok(hits)
  }

  async fn embed(&self, model_version: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let embeddings = tokio::time::timeout(
      self.config.timeout,
      self.embedder.embed(model_version, texts),
    )
    .await
    .map_err(|_| PipelineError::Timeout {
      stage: "embed",
      after: self.config.timeout,
    })??;
    if embeddings.len() != texts.len() {
      return Err(PipelineError::Embedding(format!(
        "expected {} vectors, got {}",
        texts.len(),
        embeddings.len()
      )));
    }
    Ok(embeddings)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hashing_embedder_is_deterministic_and_normalized() {
    let e = HashingEmbedder::new(64);
    let a = e.embed_one("hash-v1", "Road resurfacing in Seoul");
    let b = e.embed_one("hash-v1", "road RESURFACING in seoul");
    assert_eq!(a, b);
    let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
  }

  #[test]
  fn model_version_changes_the_vector() {
    let e = HashingEmbedder::new(64);
    assert_ne!(
      e.embed_one("hash-v1", "bridge inspection for district four in seoul"),
      e.embed_one("hash-v2", "bridge inspection for district four in seoul")
    );
  }

  #[test]
  fn empty_text_embeds_to_zero() {
    let e = HashingEmbedder::new(8);
    assert!(e.embed_one("hash-v1", "  ").iter().all(|x| *x == 0.0));
  }
}
