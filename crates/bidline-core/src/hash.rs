//! Content hashing and deterministic keys.
//!
//! Every hash is a lowercase hex SHA-256 digest.

use sha2::{Digest, Sha256};
use strum::IntoEnumIterator as _;

use crate::tender::{FieldName, NormalizedTender, RevisionId, SubscriptionId};

const UNIT_SEP: u8 = 0x1f;
const RECORD_SEP: u8 = 0x1e;

pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
  hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Hash over the untouched raw payload.
pub fn raw_content_hash(raw: &str) -> String { sha256_hex(raw.as_bytes()) }

/// Hash over the canonical field set.
///
/// Fields are visited in [`FieldName`] order and absent fields are skipped, so
/// the result depends only on field values, never on the key order of the
/// source payload.
pub fn normalized_content_hash(tender: &NormalizedTender) -> String {
  let mut hasher = Sha256::new();
  for field in FieldName::iter() {
    if let Some(value) = tender.field_value(field) {
      let name: &'static str = field.into();
      hasher.update(name.as_bytes());
      hasher.update([UNIT_SEP]);
      hasher.update(value.as_bytes());
      hasher.update([RECORD_SEP]);
    }
  }
  hex::encode(hasher.finalize())
}

/// Identity of a revision within its tender.
///
/// Derived from both content hashes and the hash of the revision the tender
/// pointed at when the change was detected. Two workers recording the same
/// observation produce the same value and collide on
/// `(tender_pk, revision_hash)`; content that reverts to an older state still
/// gets a fresh identity because its parent differs.
pub fn revision_hash(
  raw_content_hash: &str,
  normalized_content_hash: Option<&str>,
  parent_revision_hash: Option<&str>,
) -> String {
  let mut hasher = Sha256::new();
  for part in [
    raw_content_hash,
    normalized_content_hash.unwrap_or("failed"),
    parent_revision_hash.unwrap_or("root"),
  ] {
    hasher.update(part.as_bytes());
    hasher.update([UNIT_SEP]);
  }
  hex::encode(hasher.finalize())
}

/// Deduplication key for notifying one subscription about one revision.
pub fn event_key(subscription: SubscriptionId, revision: RevisionId) -> String {
  sha256_hex(format!("revision-match:{subscription}:{revision}"))
}

/// Key of one embedded chunk. Includes the model version so a new model adds
/// rows next to the old ones.
pub fn chunk_hash(model_version: &str, chunk_index: usize, text: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(model_version.as_bytes());
  hasher.update([UNIT_SEP]);
  hasher.update(chunk_index.to_string().as_bytes());
  hasher.update([UNIT_SEP]);
  hasher.update(text.as_bytes());
  hex::encode(hasher.finalize())
}
