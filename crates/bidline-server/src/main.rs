//! `bidline` binary.
//!
//! Reads `bidline.toml` (or the path given with `--config`), opens the SQLite
//! store, and runs one of:
//!
//! ```text
//! bidline serve                      # HTTP API
//! bidline work                       # job worker loop
//! bidline ingest --source narajangter --tender-id 2024-001 [--file raw.json]
//! bidline sweep                      # one worker tick, report as JSON
//! ```

mod config;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use bidline_api::AppState;
use bidline_core::jobs::JobKind;
use bidline_pipeline::{
  Pipeline,
  indexer::HashingEmbedder,
  notify::{DeliveryProvider, LogProvider, WebhookProvider},
  source::{HttpSourceAdapter, RawObservation, SourceRegistry},
  submit_job,
  worker::JobWorker,
};
use bidline_store_sqlite::SqliteStore;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::{net::TcpListener, signal, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

#[derive(Parser)]
#[command(author, version, about = "Tender change tracking and notification")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "bidline.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Serve the HTTP API.
  Serve,
  /// Lease and run queued jobs until interrupted.
  Work,
  /// Ingest one observation. Without `--file` a fetch job is queued instead.
  Ingest {
    #[arg(long)]
    source:    String,
    #[arg(long)]
    tender_id: String,
    /// Raw payload to ingest directly.
    #[arg(long)]
    file:      Option<PathBuf>,
  },
  /// Recover expired leases, run one batch of jobs and deliveries, and exit.
  Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let server_cfg = config::load(cli.config).context("failed to load configuration")?;
  let pipeline = Arc::new(build_pipeline(&server_cfg).await?);

  match cli.command {
    Command::Serve => serve(&server_cfg, pipeline).await,
    Command::Work => work(&server_cfg, pipeline).await,
    Command::Ingest {
      source,
      tender_id,
      file,
    } => ingest(&server_cfg, &pipeline, source, tender_id, file).await,
    Command::Sweep => {
      let worker = JobWorker::new(pipeline, server_cfg.worker_config());
      let report = worker.tick(Utc::now()).await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
      Ok(())
    }
  }
}

async fn build_pipeline(cfg: &ServerConfig) -> anyhow::Result<Pipeline<SqliteStore>> {
  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;

  let client = reqwest::Client::builder()
    .user_agent(concat!("bidline/", env!("CARGO_PKG_VERSION")))
    .build()
    .context("failed to build HTTP client")?;

  let mut sources = SourceRegistry::new();
  for source in &cfg.sources {
    sources.register(HttpSourceAdapter::new(
      &source.name,
      &source.url_template,
      client.clone(),
      Duration::from_secs(source.timeout_secs),
    ));
  }

  let mut providers: Vec<(String, Arc<dyn DeliveryProvider>)> =
    vec![("log".into(), Arc::new(LogProvider) as Arc<dyn DeliveryProvider>)];
  if let Some(url) = &cfg.delivery.webhook_url {
    let webhook = WebhookProvider::new(client, url);
    providers.push(("webhook".into(), Arc::new(webhook) as Arc<dyn DeliveryProvider>));
  }

  Ok(Pipeline::new(
    Arc::new(store),
    sources,
    Arc::new(HashingEmbedder::new(cfg.indexing.embedding_dims)),
    providers,
    cfg.pipeline_config(),
  ))
}

/// Flip the returned receiver to `true` on ctrl-c.
fn shutdown_signal() -> watch::Receiver<bool> {
  let (tx, rx) = watch::channel(false);
  tokio::spawn(async move {
    if let Err(e) = signal::ctrl_c().await {
      tracing::error!(error = %e, "failed to listen for ctrl-c");
      return;
    }
    info!("shutdown requested");
    let _ = tx.send(true);
  });
  rx
}

async fn serve(cfg: &ServerConfig, pipeline: Arc<Pipeline<SqliteStore>>) -> anyhow::Result<()> {
  if cfg.cron_secret.is_none() {
    tracing::warn!("no cron secret configured; operator endpoints will reject every request");
  }
  let state = AppState::new(pipeline, cfg.cron_secret.clone(), cfg.retry_batch_size);
  let app = bidline_api::api_router(state).layer(TraceLayer::new_for_http());

  let address = cfg.address();
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;
  info!("Listening on http://{address}");

  let mut shutdown = shutdown_signal();
  axum::serve(listener, app)
    .with_graceful_shutdown(async move {
      let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await
    .context("server error")?;
  Ok(())
}

async fn work(cfg: &ServerConfig, pipeline: Arc<Pipeline<SqliteStore>>) -> anyhow::Result<()> {
  let worker = JobWorker::new(pipeline, cfg.worker_config());
  worker.run(shutdown_signal()).await;
  Ok(())
}

async fn ingest(
  cfg: &ServerConfig,
  pipeline: &Pipeline<SqliteStore>,
  source: String,
  tender_id: String,
  file: Option<PathBuf>,
) -> anyhow::Result<()> {
  let Some(path) = file else {
    pipeline.sources.get(&source)?;
    let queued = submit_job(
      pipeline.store.as_ref(),
      JobKind::Fetch {
        source,
        tender_id,
        requested_at: Utc::now(),
      },
      cfg.worker.max_attempts,
      Utc::now(),
    )
    .await?;
    println!("{}", if queued { "fetch job queued" } else { "fetch job already queued" });
    return Ok(());
  };

  let raw_payload = tokio::fs::read_to_string(&path)
    .await
    .with_context(|| format!("failed to read {}", path.display()))?;
  let outcome = pipeline
    .ingest(RawObservation {
      source,
      tender_id,
      raw_payload,
      observed_at: Utc::now(),
    })
    .await?;
  println!("{outcome:?}");
  Ok(())
}
