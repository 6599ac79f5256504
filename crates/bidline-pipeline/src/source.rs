//! Source adapters: fetch one raw tender payload from an external source.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bidline_core::retry::FailureClass;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{PipelineError, Result};

/// One raw payload as captured from a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObservation {
  pub source:      String,
  pub tender_id:   String,
  pub raw_payload: String,
  pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
  fn name(&self) -> &str;

  /// Fetch the current payload for `tender_id`. Network I/O only.
  async fn fetch(&self, tender_id: &str) -> Result<RawObservation>;
}

/// 5xx and 429 are worth retrying; any other client error is not.
pub fn classify_status(status: StatusCode) -> FailureClass {
  if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
    FailureClass::Transient
  } else {
    FailureClass::Permanent
  }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// GETs `url_template` with `{tender_id}` substituted.
pub struct HttpSourceAdapter {
  name:         String,
  url_template: String,
  client:       reqwest::Client,
  timeout:      Duration,
}

impl HttpSourceAdapter {
  pub fn new(
    name: impl Into<String>,
    url_template: impl Into<String>,
    client: reqwest::Client,
    timeout: Duration,
  ) -> Self {
    Self {
      name: name.into(),
      url_template: url_template.into(),
      client,
      timeout,
    }
  }

  pub fn url_for(&self, tender_id: &str) -> String {
    self.url_template.replace("{tender_id}", tender_id)
  }

  fn error(&self, message: impl Into<String>, class: FailureClass) -> PipelineError {
    PipelineError::Source {
      adapter: self.name.clone(),
      message: message.into(),
      class,
    }
  }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
  fn name(&self) -> &str { &self.name }

  async fn fetch(&self, tender_id: &str) -> Result<RawObservation> {
    let url = self.url_for(tender_id);
    let request = async {
      let response = self
        .client
        .get(&url)
        .send()
        .await
        .map_err(|e| self.error(e.to_string(), FailureClass::Transient))?;

      let status = response.status();
      if !status.is_success() {
        return Err(self.error(format!("HTTP {status} from {url}"), classify_status(status)));
      }
      let body = response
        .text()
        .await
        .map_err(|e| self.error(e.to_string(), FailureClass::Transient))?;
      Ok::<_, PipelineError>(body)
    };

    let raw_payload = tokio::time::timeout(self.timeout, request)
      .await
      .map_err(|_| PipelineError::Timeout {
        stage: "fetch",
        after: self.timeout,
      })??;

    Ok(RawObservation {
      source: self.name.clone(),
      tender_id: tender_id.to_owned(),
      raw_payload,
      observed_at: Utc::now(),
    })
  }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Adapters keyed by source name.
#[derive(Default, Clone)]
pub struct SourceRegistry {
  adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
  pub fn new() -> Self { Self::default() }

  pub fn register(&mut self, adapter: impl SourceAdapter + 'static) {
    self
      .adapters
      .insert(adapter.name().to_owned(), Arc::new(adapter));
  }

  pub fn get(&self, name: &str) -> Result<Arc<dyn SourceAdapter>> {
    self
      .adapters
      .get(name)
      .cloned()
      .ok_or_else(|| PipelineError::UnknownSource(name.to_owned()))
  }

  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }
}
