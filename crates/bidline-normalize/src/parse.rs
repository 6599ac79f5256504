//! Value-level parsing: text cleanup, dates, amounts and URLs.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// Trimmed, whitespace-collapsed text. Empty strings and nulls are absent.
pub(crate) fn text(value: &Value) -> Option<String> {
  let raw = match value {
    Value::String(s) => s.clone(),
    Value::Number(n) => n.to_string(),
    Value::Bool(b) => b.to_string(),
    _ => return None,
  };
  let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
  (!collapsed.is_empty()).then_some(collapsed)
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &[
  "%Y-%m-%d %H:%M:%S",
  "%Y-%m-%d %H:%M",
  "%Y-%m-%dT%H:%M:%S",
  "%Y/%m/%d %H:%M",
  "%Y%m%d%H%M",
  "%Y%m%d%H%M%S",
];

/// Calendar date of a deadline. Times are dropped; offsets are kept local to
/// the source.
pub(crate) fn date(s: &str) -> Option<NaiveDate> {
  let s = s.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.date_naive());
  }
  DATETIME_FORMATS
    .iter()
    .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
    .map(|dt| dt.date())
    .or_else(|| {
      DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
    })
}

/// Whole-unit amount from a JSON number or a string such as `"1,200,000원"`.
///
/// Returns `Err(())` for values that are present but not a non-negative
/// amount.
pub(crate) fn amount(value: &Value) -> Result<Option<i64>, ()> {
  let parsed = match value {
    Value::Null => return Ok(None),
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
    Value::String(s) => {
      let cleaned: String = s
        .trim()
        .trim_end_matches("KRW")
        .trim_end_matches('원')
        .trim_start_matches('₩')
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '_'))
        .collect();
      if cleaned.is_empty() {
        return Ok(None);
      }
      cleaned
        .parse::<i64>()
        .ok()
        .or_else(|| cleaned.parse::<f64>().ok().and_then(integral))
    }
    _ => None,
  };
  match parsed {
    Some(n) if n >= 0 => Ok(Some(n)),
    _ => Err(()),
  }
}

fn integral(f: f64) -> Option<i64> {
  (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// HTTP(S) links found in a string or array value.
pub(crate) fn urls(value: &Value) -> Vec<String> {
  match value {
    Value::String(s) => s
      .split(|c: char| c.is_whitespace() || c == ',')
      .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
      .map(str::to_owned)
      .collect(),
    Value::Array(items) => items.iter().flat_map(urls).collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn text_collapses_whitespace() {
    assert_eq!(text(&json!("  Road \n repair ")), Some("Road repair".into()));
    assert_eq!(text(&json!("   ")), None);
    assert_eq!(text(&json!(null)), None);
    assert_eq!(text(&json!(42)), Some("42".into()));
  }

  #[test]
  fn dates_in_source_formats() {
    let expected = NaiveDate::from_ymd_opt(2025, 1, 1);
    for s in [
      "2025-01-01",
      "2025/01/01",
      "20250101",
      "202501011800",
      "2025-01-01 18:00",
      "2025-01-01 18:00:00",
      "2025-01-01T18:00:00+09:00",
    ] {
      assert_eq!(date(s), expected, "{s}");
    }
    assert_eq!(date("next tuesday"), None);
  }

  #[test]
  fn amounts_strip_separators_and_currency() {
    assert_eq!(amount(&json!("1,200,000원")), Ok(Some(1_200_000)));
    assert_eq!(amount(&json!("₩ 5 000")), Ok(Some(5_000)));
    assert_eq!(amount(&json!(3500)), Ok(Some(3_500)));
    assert_eq!(amount(&json!("120000.0")), Ok(Some(120_000)));
    assert_eq!(amount(&json!("")), Ok(None));
    assert_eq!(amount(&json!(null)), Ok(None));
    assert_eq!(amount(&json!("-5")), Err(()));
    assert_eq!(amount(&json!("lots")), Err(()));
  }

  #[test]
  fn urls_from_strings_and_arrays() {
    assert_eq!(
      urls(&json!("https://a.example, http://b.example ftp://c")),
      vec!["https://a.example", "http://b.example"]
    );
    assert_eq!(
      urls(&json!(["https://a.example", ["https://b.example"]])),
      vec!["https://a.example", "https://b.example"]
    );
  }
}
