//! Change detection between successive observations of a tender.

use std::collections::BTreeSet;

use strum::IntoEnumIterator as _;

use crate::tender::{FieldName, NormalizedTender};

/// Outcome of comparing a new normalized hash with the tender's latest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
  /// The tender has never been seen; this will be revision 1.
  FirstRevision,
  /// Content is identical to the latest revision; nothing is written.
  NoOp,
  /// Content differs; a new revision is appended.
  NewRevision,
}

pub fn detect(latest_normalized_hash: Option<&str>, new_hash: &str) -> ChangeDecision {
  match latest_normalized_hash {
    None => ChangeDecision::FirstRevision,
    Some(latest) if latest == new_hash => ChangeDecision::NoOp,
    Some(_) => ChangeDecision::NewRevision,
  }
}

/// Canonical fields whose value differs between `previous` and `next`.
///
/// With no previous revision every field present in `next` counts as changed.
pub fn changed_fields(
  previous: Option<&NormalizedTender>,
  next: &NormalizedTender,
) -> BTreeSet<FieldName> {
  FieldName::iter()
    .filter(|&field| {
      let after = next.field_value(field);
      match previous {
        Some(prev) => prev.field_value(field) != after,
        None => after.is_some(),
      }
    })
    .collect()
}
