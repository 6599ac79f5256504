//! Source payload key aliases for each canonical field.
//!
//! Source-specific aliases are consulted before the generic table.

use bidline_core::tender::FieldName;

/// Keys understood for every source.
fn generic(field: FieldName) -> &'static [&'static str] {
  match field {
    FieldName::Title => &["title", "name", "subject"],
    FieldName::Agency => &["agency", "organization", "buyer"],
    FieldName::Deadline => &["deadline", "due_date", "closing_date", "closes_at"],
    FieldName::Budget => &["budget", "amount", "estimated_price"],
    FieldName::Region => &["region", "location"],
    FieldName::Category => &["category", "kind"],
    FieldName::Urls => &["urls", "url", "links", "link"],
    FieldName::Description => &["description", "summary", "body"],
  }
}

/// Korean public e-procurement (나라장터) open API response keys.
fn narajangter(field: FieldName) -> &'static [&'static str] {
  match field {
    FieldName::Title => &["bidNtceNm"],
    FieldName::Agency => &["ntceInsttNm", "dminsttNm"],
    FieldName::Deadline => &["bidClseDt", "bidClseDate"],
    FieldName::Budget => &["asignBdgtAmt", "presmptPrce"],
    FieldName::Region => &["prtcptPsblRgnNm", "rgnNm"],
    FieldName::Category => &["pubPrcrmntClsfcNm", "bsnsDivNm"],
    FieldName::Urls => &["bidNtceDtlUrl", "bidNtceUrl"],
    FieldName::Description => &["bidNtceDtl"],
  }
}

/// Aliases for `field` in lookup order.
pub(crate) fn aliases(source: &str, field: FieldName) -> Vec<&'static str> {
  let specific: &[&str] = match source {
    "narajangter" => narajangter(field),
    _ => &[],
  };
  specific.iter().chain(generic(field)).copied().collect()
}
