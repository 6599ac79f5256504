//! Runtime configuration.
//!
//! Read from an optional TOML file, then overlaid with `BIDLINE_*`
//! environment variables (`__` separates nested keys, e.g.
//! `BIDLINE_WORKER__BATCH_SIZE=20`). `CRON_SECRET` is honoured as-is.

use std::{path::PathBuf, time::Duration};

use bidline_core::{matching::MatchConfig, retry::BackoffPolicy};
use bidline_pipeline::{
  PipelineConfig, indexer::IndexerConfig, notify::NotifierConfig, worker::WorkerConfig,
};
use chrono::TimeDelta;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::Deserialize;

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub host:             String,
  pub port:             u16,
  pub store_path:       PathBuf,
  /// Bearer secret for the operator endpoints. Unset disables them.
  pub cron_secret:      Option<String>,
  pub retry_batch_size: usize,
  pub worker:           WorkerSection,
  pub backoff:          BackoffPolicy,
  pub delivery:         DeliverySection,
  pub matching:         MatchConfig,
  pub indexing:         IndexingSection,
  pub sources:          Vec<SourceSection>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:             "127.0.0.1".into(),
      port:             8080,
      store_path:       PathBuf::from("bidline.db"),
      cron_secret:      None,
      retry_batch_size: 10,
      worker:           WorkerSection::default(),
      backoff:          BackoffPolicy::default(),
      delivery:         DeliverySection::default(),
      matching:         MatchConfig::default(),
      indexing:         IndexingSection::default(),
      sources:          Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
  pub poll_interval_ms:    u64,
  pub lease_secs:          i64,
  pub batch_size:          usize,
  /// Attempt budget for queued jobs.
  pub max_attempts:        u32,
  pub delivery_grace_secs: i64,
}

impl Default for WorkerSection {
  fn default() -> Self {
    Self {
      poll_interval_ms:    2_000,
      lease_secs:          300,
      batch_size:          10,
      max_attempts:        5,
      delivery_grace_secs: 600,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
  pub max_attempts: u32,
  pub timeout_secs: u64,
  /// Enables the `webhook` channel when set.
  pub webhook_url:  Option<String>,
}

impl Default for DeliverySection {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      timeout_secs: 10,
      webhook_url:  None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexingSection {
  pub model_version:  String,
  pub chunk_chars:    usize,
  pub embedding_dims: usize,
  pub timeout_secs:   u64,
}

impl Default for IndexingSection {
  fn default() -> Self {
    Self {
      model_version:  "hash-v1".into(),
      chunk_chars:    800,
      embedding_dims: 256,
      timeout_secs:   30,
    }
  }
}

/// One upstream procurement portal.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
  pub name:         String,
  /// URL with a `{tender_id}` placeholder.
  pub url_template: String,
  #[serde(default = "default_source_timeout")]
  pub timeout_secs: u64,
}

fn default_source_timeout() -> u64 { 30 }

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load from `path` (missing is fine) and the environment.
pub fn load(path: PathBuf) -> Result<ServerConfig, ConfigError> {
  let builder = Config::builder()
    .add_source(File::from(path).required(false))
    .add_source(
      Environment::with_prefix("BIDLINE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true),
    )
    .set_override_option("cron_secret", std::env::var("CRON_SECRET").ok())?;
  finish(builder)
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<ServerConfig, ConfigError> {
  let mut config: ServerConfig = builder.build()?.try_deserialize()?;
  config.cron_secret = config.cron_secret.filter(|s| !s.trim().is_empty());
  Ok(config)
}

// ─── Conversions ─────────────────────────────────────────────────────────────

impl ServerConfig {
  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

  pub fn pipeline_config(&self) -> PipelineConfig {
    PipelineConfig {
      model_version:    self.indexing.model_version.clone(),
      job_max_attempts: self.worker.max_attempts,
      indexer:          IndexerConfig {
        chunk_chars: self.indexing.chunk_chars,
        timeout: Duration::from_secs(self.indexing.timeout_secs),
        ..Default::default()
      },
      matching:         self.matching,
      notifier:         NotifierConfig {
        max_attempts: self.delivery.max_attempts,
        timeout:      Duration::from_secs(self.delivery.timeout_secs),
        backoff:      self.backoff,
        grace:        TimeDelta::seconds(self.worker.delivery_grace_secs),
      },
    }
  }

  pub fn worker_config(&self) -> WorkerConfig {
    WorkerConfig {
      poll_interval:  Duration::from_millis(self.worker.poll_interval_ms),
      lease:          TimeDelta::seconds(self.worker.lease_secs),
      batch_size:     self.worker.batch_size,
      delivery_batch: self.retry_batch_size,
      backoff:        self.backoff,
    }
  }
}
