//! Raw source payload to canonical tender schema.
//!
//! Pure synchronous; no HTTP or database dependencies. Sources publish JSON
//! objects with their own key names; [`normalize`] resolves them through a
//! per-source alias table into a [`NormalizedTender`].
//!
//! # Quick start
//!
//! ```no_run
//! let raw = r#"{"bidNtceNm": "Road repair", "bidClseDt": "2025-01-01 18:00"}"#;
//! let tender = bidline_normalize::normalize("narajangter", raw).unwrap();
//! assert_eq!(tender.title, "Road repair");
//! ```

pub mod error;
mod fields;
mod parse;

use bidline_core::tender::{FieldName, NormalizedTender};
use serde_json::{Map, Value};

pub use error::{Error, Result};

/// Normalize one raw payload observed from `source`.
pub fn normalize(source: &str, raw: &str) -> Result<NormalizedTender> {
  let value: Value =
    serde_json::from_str(raw).map_err(|e| Error::Malformed(e.to_string()))?;
  let object = unwrap_envelope(&value)
    .ok_or_else(|| Error::Malformed("payload is not a JSON object".into()))?;

  let text = |field: FieldName| lookup(object, source, field).and_then(parse::text);

  let title = text(FieldName::Title).ok_or(Error::MissingField(FieldName::Title))?;

  let deadline = match text(FieldName::Deadline) {
    None => None,
    Some(s) => Some(parse::date(&s).ok_or(Error::InvalidField {
      field: FieldName::Deadline,
      value: s,
    })?),
  };

  let budget = match lookup(object, source, FieldName::Budget) {
    None => None,
    Some(v) => parse::amount(v).map_err(|()| Error::InvalidField {
      field: FieldName::Budget,
      value: v.to_string(),
    })?,
  };

  let mut urls: Vec<String> = fields::aliases(source, FieldName::Urls)
    .into_iter()
    .filter_map(|key| object.get(key))
    .flat_map(parse::urls)
    .collect();
  urls.sort();
  urls.dedup();

  Ok(NormalizedTender {
    title,
    agency: text(FieldName::Agency),
    deadline,
    budget,
    region: text(FieldName::Region),
    category: text(FieldName::Category),
    urls,
    description: text(FieldName::Description),
  })
}

/// Descend through common API envelopes (`response.body.items.item`) down to
/// the single announcement object.
fn unwrap_envelope(value: &Value) -> Option<&Map<String, Value>> {
  let mut current = value;
  loop {
    match current {
      Value::Array(items) if items.len() == 1 => current = &items[0],
      Value::Object(map) => {
        let next = ["response", "body", "items", "item"]
          .iter()
          .find_map(|key| (map.len() == 1).then(|| map.get(*key)).flatten());
        match next {
          Some(inner) => current = inner,
          None => return Some(map),
        }
      }
      _ => return None,
    }
  }
}

/// First non-blank value among the aliases of `field`.
fn lookup<'a>(
  object: &'a Map<String, Value>,
  source: &str,
  field: FieldName,
) -> Option<&'a Value> {
  fields::aliases(source, field)
    .into_iter()
    .filter_map(|key| object.get(key))
    .find(|v| !is_blank(v))
}

fn is_blank(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::String(s) => s.trim().is_empty(),
    _ => false,
  }
}
