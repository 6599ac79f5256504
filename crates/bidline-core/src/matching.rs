//! Deterministic two-phase scoring of a revision against a subscription.
//!
//! Phase one applies the subscription's hard filters; any failure forces a
//! zero score. Phase two computes a weighted sum of soft signals normalized to
//! `[0, 100]`. The weight table is configuration.

use std::{cmp::Ordering, collections::BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator as _};

use crate::{
  subscription::{BudgetBand, Subscription},
  tender::{NormalizedTender, RevisionId, SubscriptionId},
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Relative weight of each soft signal. Only the ratios matter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightTable {
  pub category_preference: f64,
  pub region_preference:   f64,
  pub budget_fit:          f64,
  pub keyword_overlap:     f64,
}

impl Default for WeightTable {
  fn default() -> Self {
    Self {
      category_preference: 0.4,
      region_preference:   0.3,
      budget_fit:          0.2,
      keyword_overlap:     0.1,
    }
  }
}

impl WeightTable {
  pub fn weight(&self, signal: Signal) -> f64 {
    let w = match signal {
      Signal::CategoryPreference => self.category_preference,
      Signal::RegionPreference => self.region_preference,
      Signal::BudgetFit => self.budget_fit,
      Signal::KeywordOverlap => self.keyword_overlap,
    };
    w.max(0.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
  /// Minimum fit score for `is_match`.
  pub threshold:     f64,
  /// A deadline this many days away or closer raises `deadline_imminent`.
  pub imminent_days: i64,
  pub weights:       WeightTable,
}

impl Default for MatchConfig {
  fn default() -> Self {
    Self {
      threshold:     40.0,
      imminent_days: 3,
      weights:       WeightTable::default(),
    }
  }
}

// ─── Explanation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HardFilter {
  Region,
  Category,
  Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCheck {
  pub filter: HardFilter,
  pub passed: bool,
  pub detail: String,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  Display,
  EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Signal {
  CategoryPreference,
  RegionPreference,
  BudgetFit,
  KeywordOverlap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalScore {
  pub signal:       Signal,
  /// Raw signal strength in `[0, 1]`.
  pub value:        f64,
  pub weight:       f64,
  /// Points this signal adds to the fit score.
  pub contribution: f64,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskFlag {
  DeadlineUnknown,
  DeadlineImminent,
  BudgetUnknown,
  BudgetOutOfBand,
}

/// Fixed three-part scoring rationale stored with every match result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
  pub hard_filters: Vec<FilterCheck>,
  /// Contributing signals, strongest first.
  pub top_signals:  Vec<SignalScore>,
  pub risk_flags:   BTreeSet<RiskFlag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
  pub fit_score:    f64,
  pub is_match:     bool,
  /// Number of soft signals with a non-zero value. Breaks score ties.
  pub signal_count: u32,
  pub explanation:  Explanation,
}

/// One `match_results` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
  pub subscription_id: SubscriptionId,
  pub revision_id:     RevisionId,
  pub fit_score:       f64,
  pub is_match:        bool,
  pub signal_count:    u32,
  pub explanation:     Explanation,
  pub evaluated_at:    DateTime<Utc>,
}

impl MatchResult {
  pub fn from_evaluation(
    subscription_id: SubscriptionId,
    revision_id: RevisionId,
    evaluation: Evaluation,
    evaluated_at: DateTime<Utc>,
  ) -> Self {
    Self {
      subscription_id,
      revision_id,
      fit_score: evaluation.fit_score,
      is_match: evaluation.is_match,
      signal_count: evaluation.signal_count,
      explanation: evaluation.explanation,
      evaluated_at,
    }
  }
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

pub fn evaluate(
  tender: &NormalizedTender,
  subscription: &Subscription,
  config: &MatchConfig,
  today: NaiveDate,
) -> Evaluation {
  let hard_filters = hard_filters(tender, subscription, today);
  let risk_flags = risk_flags(tender, subscription, config, today);
  let passed = hard_filters.iter().all(|c| c.passed);

  if !passed {
    return Evaluation {
      fit_score: 0.0,
      is_match: false,
      signal_count: 0,
      explanation: Explanation {
        hard_filters,
        top_signals: Vec::new(),
        risk_flags,
      },
    };
  }

  let raw: Vec<(Signal, f64, f64)> = Signal::iter()
    .filter_map(|s| {
      signal_value(s, tender, subscription).map(|v| (s, v, config.weights.weight(s)))
    })
    .collect();
  let total_weight: f64 = raw.iter().map(|(_, _, w)| w).sum();

  let (fit_score, mut top_signals) = if total_weight > 0.0 {
    let scores: Vec<SignalScore> = raw
      .iter()
      .map(|&(signal, value, weight)| SignalScore {
        signal,
        value: round2(value),
        weight,
        contribution: round2(weight * value / total_weight * 100.0),
      })
      .collect();
    let sum: f64 = raw.iter().map(|(_, v, w)| v * w).sum();
    (round2(sum / total_weight * 100.0), scores)
  } else {
    // Nothing to prefer: passing the hard filters is a full fit.
    (100.0, Vec::new())
  };

  let signal_count = raw.iter().filter(|(_, v, _)| *v > 0.0).count() as u32;
  top_signals.retain(|s| s.contribution > 0.0);
  top_signals.sort_by(|a, b| {
    b.contribution
      .total_cmp(&a.contribution)
      .then_with(|| a.signal.cmp(&b.signal))
  });

  Evaluation {
    fit_score,
    is_match: fit_score >= config.threshold,
    signal_count,
    explanation: Explanation {
      hard_filters,
      top_signals,
      risk_flags,
    },
  }
}

/// Order results by fit score, then signal count, then subscription id.
pub fn rank(results: &mut [MatchResult]) { results.sort_by(compare_ranked); }

fn compare_ranked(a: &MatchResult, b: &MatchResult) -> Ordering {
  b.fit_score
    .total_cmp(&a.fit_score)
    .then_with(|| b.signal_count.cmp(&a.signal_count))
    .then_with(|| a.subscription_id.cmp(&b.subscription_id))
}

fn hard_filters(
  tender: &NormalizedTender,
  subscription: &Subscription,
  today: NaiveDate,
) -> Vec<FilterCheck> {
  let criteria = &subscription.criteria;
  let mut checks = Vec::new();

  if has_terms(&criteria.regions) {
    let passed = matches_any(tender.region.as_deref(), &criteria.regions);
    checks.push(FilterCheck {
      filter: HardFilter::Region,
      passed,
      detail: describe("region", tender.region.as_deref(), &criteria.regions),
    });
  }

  if has_terms(&criteria.categories) {
    let passed = matches_any(tender.category.as_deref(), &criteria.categories);
    checks.push(FilterCheck {
      filter: HardFilter::Category,
      passed,
      detail: describe("category", tender.category.as_deref(), &criteria.categories),
    });
  }

  if criteria.require_open {
    let (passed, detail) = match tender.deadline {
      Some(deadline) if deadline >= today => (true, format!("deadline {deadline} is open")),
      Some(deadline) => (false, format!("deadline {deadline} is before {today}")),
      None => (true, "deadline unknown".to_owned()),
    };
    checks.push(FilterCheck {
      filter: HardFilter::Deadline,
      passed,
      detail,
    });
  }

  checks
}

fn signal_value(
  signal: Signal,
  tender: &NormalizedTender,
  subscription: &Subscription,
) -> Option<f64> {
  let profile = &subscription.profile_fields;
  match signal {
    Signal::CategoryPreference => has_terms(&profile.preferred_categories).then(|| {
      indicator(matches_any(tender.category.as_deref(), &profile.preferred_categories))
    }),
    Signal::RegionPreference => has_terms(&profile.preferred_regions).then(|| {
      indicator(matches_any(tender.region.as_deref(), &profile.preferred_regions))
    }),
    Signal::BudgetFit => profile
      .budget_band
      .map(|band| tender.budget.map_or(0.0, |b| budget_fit(b, band))),
    Signal::KeywordOverlap => {
      let keywords: Vec<String> = profile
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
      if keywords.is_empty() {
        return None;
      }
      let haystack = format!(
        "{} {}",
        tender.title,
        tender.description.as_deref().unwrap_or_default()
      )
      .to_lowercase();
      let hits = keywords.iter().filter(|k| haystack.contains(k.as_str())).count();
      Some(hits as f64 / keywords.len() as f64)
    }
  }
}

fn risk_flags(
  tender: &NormalizedTender,
  subscription: &Subscription,
  config: &MatchConfig,
  today: NaiveDate,
) -> BTreeSet<RiskFlag> {
  let mut flags = BTreeSet::new();
  match tender.deadline {
    None => {
      flags.insert(RiskFlag::DeadlineUnknown);
    }
    Some(deadline) => {
      let days_left = (deadline - today).num_days();
      if (0..=config.imminent_days).contains(&days_left) {
        flags.insert(RiskFlag::DeadlineImminent);
      }
    }
  }
  match (tender.budget, subscription.profile_fields.budget_band) {
    (None, _) => {
      flags.insert(RiskFlag::BudgetUnknown);
    }
    (Some(budget), Some(band)) if budget_fit(budget, band) < 1.0 => {
      flags.insert(RiskFlag::BudgetOutOfBand);
    }
    _ => {}
  }
  flags
}

/// `1.0` inside the band, decaying proportionally outside it.
fn budget_fit(budget: i64, band: BudgetBand) -> f64 {
  if let Some(min) = band.min
    && budget < min
  {
    return if min > 0 { (budget.max(0) as f64) / (min as f64) } else { 0.0 };
  }
  if let Some(max) = band.max
    && budget > max
  {
    return if budget > 0 { (max.max(0) as f64) / (budget as f64) } else { 0.0 };
  }
  1.0
}

fn has_terms(terms: &[String]) -> bool { terms.iter().any(|t| !t.trim().is_empty()) }

/// Case-insensitive; a wanted term matches when the value contains it.
fn matches_any(value: Option<&str>, wanted: &[String]) -> bool {
  let Some(value) = value else {
    return false;
  };
  let value = value.to_lowercase();
  wanted
    .iter()
    .map(|w| w.trim().to_lowercase())
    .any(|w| !w.is_empty() && value.contains(&w))
}

fn describe(field: &str, value: Option<&str>, wanted: &[String]) -> String {
  format!(
    "{field} {:?} against [{}]",
    value.unwrap_or("unknown"),
    wanted.join(", ")
  )
}

fn indicator(hit: bool) -> f64 { if hit { 1.0 } else { 0.0 } }

fn round2(x: f64) -> f64 { (x * 100.0).round() / 100.0 }
