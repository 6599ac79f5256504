//! Notification outbox: enqueue deliveries for matches, then attempt them.
//!
//! Every send goes through one `delivery_logs` row. Enqueueing is
//! insert-or-ignore on `(subscription, channel, event_key)`; attempts claim
//! due rows conditionally, so two workers never send the same row.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bidline_core::{
  delivery::{DeliveryFailure, DeliveryLog, NewDelivery},
  matching::{Explanation, MatchResult},
  retry::{BackoffPolicy, FailureClass},
  store::TenderStore,
  tender::{DeliveryId, RevisionId, SubscriptionId},
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{PipelineError, Result, source::classify_status};

// ─── Providers ───────────────────────────────────────────────────────────────

/// The payload handed to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
  pub delivery_id:       DeliveryId,
  pub event_key:         String,
  pub channel:           String,
  pub subscription_id:   SubscriptionId,
  pub subscription_name: String,
  pub user_ref:          String,
  pub revision_id:       RevisionId,
  pub title:             String,
  pub fit_score:         f64,
  pub explanation:       Option<Explanation>,
}

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
  #[error("transient delivery failure: {0}")]
  Transient(String),
  #[error("permanent delivery failure: {0}")]
  Permanent(String),
}

impl DeliveryError {
  pub fn class(&self) -> FailureClass {
    match self {
      DeliveryError::Transient(_) => FailureClass::Transient,
      DeliveryError::Permanent(_) => FailureClass::Permanent,
    }
  }
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
  async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Writes notifications to the log. Always succeeds.
#[derive(Debug, Default, Clone)]
pub struct LogProvider;

#[async_trait]
impl DeliveryProvider for LogProvider {
  async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
    info!(
      delivery_id = %n.delivery_id,
      subscription_id = %n.subscription_id,
      revision_id = %n.revision_id,
      user_ref = %n.user_ref,
      fit_score = n.fit_score,
      title = %n.title,
      "notification"
    );
    Ok(())
  }
}

/// POSTs the notification as JSON. The event key travels as
/// `Idempotency-Key` so the receiver can drop replays.
pub struct WebhookProvider {
  client: reqwest::Client,
  url:    String,
}

impl WebhookProvider {
  pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
    Self {
      client,
      url: url.into(),
    }
  }
}

#[async_trait]
impl DeliveryProvider for WebhookProvider {
  async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
    let response = self
      .client
      .post(&self.url)
      .header("Idempotency-Key", &n.event_key)
      .json(n)
      .send()
      .await
      .map_err(|e| DeliveryError::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }
    let message = format!("HTTP {status} from {}", self.url);
    match classify_status(status) {
      FailureClass::Transient => Err(DeliveryError::Transient(message)),
      FailureClass::Permanent => Err(DeliveryError::Permanent(message)),
    }
  }
}

// ─── Notifier ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NotifierConfig {
  pub max_attempts: u32,
  pub timeout:      Duration,
  pub backoff:      BackoffPolicy,
  /// How long a row may sit in `processing` before it is requeued.
  pub grace:        TimeDelta,
}

impl Default for NotifierConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      timeout:      Duration::from_secs(10),
      backoff:      BackoffPolicy::default(),
      grace:        TimeDelta::minutes(10),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueReport {
  pub queued:     usize,
  pub duplicates: usize,
}

/// Result of one [`Notifier::process_due`] batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
  pub processed: usize,
  pub success:   usize,
  pub failed:    usize,
  pub errors:    Vec<String>,
}

pub struct Notifier<S> {
  store:     Arc<S>,
  providers: HashMap<String, Arc<dyn DeliveryProvider>>,
  config:    NotifierConfig,
}

impl<S: TenderStore> Notifier<S> {
  pub fn new(store: Arc<S>, config: NotifierConfig) -> Self {
    Self {
      store,
      providers: HashMap::new(),
      config,
    }
  }

  /// Route `channel` to `provider`. Channels without a provider fail
  /// permanently on their first attempt.
  pub fn with_provider(
    mut self,
    channel: impl Into<String>,
    provider: Arc<dyn DeliveryProvider>,
  ) -> Self {
    self.providers.insert(channel.into(), provider);
    self
  }

  /// One delivery row per matching result per subscription channel.
  pub async fn enqueue_for_matches(&self, matches: &[MatchResult]) -> Result<EnqueueReport> {
    let mut report = EnqueueReport::default();
    let now = Utc::now();
    for result in matches.iter().filter(|m| m.is_match) {
      let Some(subscription) = self
        .store
        .get_subscription(result.subscription_id)
        .await
        .map_err(PipelineError::store)?
      else {
        continue;
      };
      for channel in &subscription.channels {
        let queued = self
          .store
          .enqueue_delivery(NewDelivery {
            subscription_id: subscription.id,
            revision_id:     result.revision_id,
            channel:         channel.clone(),
            max_attempts:    self.config.max_attempts,
            queued_at:       now,
          })
          .await
          .map_err(PipelineError::store)?;
        match queued {
          Some(log) => {
            info!(
              delivery_id = %log.id,
              subscription_id = %subscription.id,
              revision_id = %result.revision_id,
              channel = %channel,
              "delivery queued"
            );
            report.queued += 1;
          }
          None => report.duplicates += 1,
        }
      }
    }
    Ok(report)
  }

  /// Claim up to `limit` due rows and attempt each once.
  pub async fn process_due(&self, now: DateTime<Utc>, limit: usize) -> Result<RetryReport> {
    let claimed = self
      .store
      .claim_due_deliveries(now, limit)
      .await
      .map_err(PipelineError::store)?;

    let mut report = RetryReport {
      processed: claimed.len(),
      ..Default::default()
    };
    // A row that cannot be settled stays in `processing` for the stale
    // sweep; the rest of the batch still runs.
    for log in claimed {
      let id = log.id;
      match self.settle(&log, now).await {
        Ok(None) => report.success += 1,
        Ok(Some(e)) => {
          report.failed += 1;
          report.errors.push(format!("delivery {id}: {e}"));
        }
        Err(e) => {
          error!(delivery_id = %id, error = %e, "could not record delivery outcome");
          report.failed += 1;
          report.errors.push(format!("delivery {id}: {e}"));
        }
      }
    }
    Ok(report)
  }

  /// Attempt one claimed row and persist the outcome. Returns the provider
  /// error when the attempt failed.
  async fn settle(
    &self,
    log: &DeliveryLog,
    now: DateTime<Utc>,
  ) -> Result<Option<DeliveryError>> {
    let id = log.id;
    match self.attempt(log).await {
      Ok(()) => {
        self
          .store
          .mark_delivered(id, Utc::now())
          .await
          .map_err(PipelineError::store)?;
        info!(delivery_id = %id, attempt = log.attempt_count + 1, "delivered");
        Ok(None)
      }
      Err(e) => {
        let machine = log.machine().fail(e.class(), &self.config.backoff, now)?;
        let failure = DeliveryFailure::from_machine(&machine, e.to_string());
        if machine.state.is_terminal() {
          error!(delivery_id = %id, attempts = machine.attempt_count, error = %e, "delivery failed permanently");
        } else {
          warn!(
            delivery_id = %id,
            attempts = machine.attempt_count,
            next_retry_at = %machine.next_retry_at,
            error = %e,
            "delivery failed; will retry"
          );
        }
        self
          .store
          .record_delivery_failure(id, failure)
          .await
          .map_err(PipelineError::store)?;
        Ok(Some(e))
      }
    }
  }

  /// Requeue rows whose worker vanished mid-send.
  pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
    let recovered = self
      .store
      .recover_stale_deliveries(now - self.config.grace)
      .await
      .map_err(PipelineError::store)?;
    if recovered > 0 {
      warn!(recovered, "requeued stale deliveries");
    }
    Ok(recovered)
  }

  async fn attempt(&self, log: &DeliveryLog) -> Result<(), DeliveryError> {
    let provider = self
      .providers
      .get(&log.channel)
      .ok_or_else(|| DeliveryError::Permanent(format!("no provider for channel {:?}", log.channel)))?;
    let notification = self
      .notification(log)
      .await
      .map_err(|e| match e.class() {
        FailureClass::Transient => DeliveryError::Transient(e.to_string()),
        FailureClass::Permanent => DeliveryError::Permanent(e.to_string()),
      })?;

    tokio::time::timeout(self.config.timeout, provider.send(&notification))
      .await
      .map_err(|_| {
        DeliveryError::Transient(format!("provider timed out after {:?}", self.config.timeout))
      })?
  }

  async fn notification(&self, log: &DeliveryLog) -> Result<Notification> {
    let subscription = self
      .store
      .get_subscription(log.subscription_id)
      .await
      .map_err(PipelineError::store)?;
    let revision = self
      .store
      .get_revision(log.revision_id)
      .await
      .map_err(PipelineError::store)?
      .ok_or(PipelineError::RevisionNotFound(log.revision_id))?;
    let matched = self
      .store
      .list_matches(log.revision_id)
      .await
      .map_err(PipelineError::store)?
      .into_iter()
      .find(|m| m.subscription_id == log.subscription_id);

    let (subscription_name, user_ref) = subscription
      .map(|s| (s.name, s.user_ref))
      .unwrap_or_default();
    Ok(Notification {
      delivery_id: log.id,
      event_key: log.event_key.clone(),
      channel: log.channel.clone(),
      subscription_id: log.subscription_id,
      subscription_name,
      user_ref,
      revision_id: log.revision_id,
      title: revision
        .normalized_payload
        .map(|n| n.title)
        .unwrap_or_default(),
      fit_score: matched.as_ref().map_or(0.0, |m| m.fit_score),
      explanation: matched.map(|m| m.explanation),
    })
  }
}
