//! Standing user interests, read-only to the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tender::SubscriptionId;

/// Hard filters. A revision failing any configured filter is never a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Criteria {
  /// Accepted regions; empty accepts every region.
  pub regions:      Vec<String>,
  /// Accepted categories; empty accepts every category.
  pub categories:   Vec<String>,
  /// Require `deadline >= today`.
  pub require_open: bool,
}

impl Default for Criteria {
  fn default() -> Self {
    Self {
      regions:      Vec::new(),
      categories:   Vec::new(),
      require_open: true,
    }
  }
}

/// Inclusive budget range; either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetBand {
  pub min: Option<i64>,
  pub max: Option<i64>,
}

/// Soft preference signals used for scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileFields {
  pub preferred_categories: Vec<String>,
  pub preferred_regions:    Vec<String>,
  pub budget_band:          Option<BudgetBand>,
  pub keywords:             Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
  pub id:             SubscriptionId,
  pub user_ref:       String,
  pub name:           String,
  pub channels:       Vec<String>,
  pub criteria:       Criteria,
  pub profile_fields: ProfileFields,
  pub active:         bool,
  pub created_at:     DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
  pub user_ref:       String,
  pub name:           String,
  pub channels:       Vec<String>,
  #[serde(default)]
  pub criteria:       Criteria,
  #[serde(default)]
  pub profile_fields: ProfileFields,
}
