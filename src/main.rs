//! CarScout - used-car deal pipeline for Bulgarian marketplaces
//! Scrape -> parse -> normalize -> dedupe -> price -> risk -> score ->
//! channel broadcast + per-user alerts.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use carscout_backend::blob::FsBlobStore;
use carscout_backend::delivery::transport::{DryRunTransport, MessagingTransport, TelegramTransport};
use carscout_backend::llm::HttpLlmClient;
use carscout_backend::pipeline::{self, AppState};
use carscout_backend::scrape::Scheduler;
use carscout_backend::{Config, Store};

#[derive(Debug, Parser)]
#[command(name = "carscout", about = "CarScout listing pipeline")]
struct Cli {
    /// SQLite database path (overrides DB_PATH)
    #[arg(long)]
    db: Option<String>,

    /// Worker fanout (overrides WORKER_FANOUT)
    #[arg(long)]
    workers: Option<usize>,

    /// Drain the queue once and exit instead of running the daemon
    #[arg(long)]
    once: bool,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,carscout_backend=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(workers) = cli.workers {
        config.worker_fanout = workers;
    }

    info!("🚗 CarScout pipeline starting");

    let store = Store::open(&config.db_path).context("open store")?;
    store.apply_plan_limits(&config)?;
    info!(db = %config.db_path, "📊 Store ready");

    let blob = Arc::new(FsBlobStore::new(&config.blob_dir)?);
    let llm = Arc::new(HttpLlmClient::new(&config)?);

    let messenger: Arc<dyn MessagingTransport> = if config.messaging_bot_token.is_some() {
        match TelegramTransport::new(&config) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!(error = %e, "Messaging transport unavailable, running dry");
                Arc::new(DryRunTransport::new())
            }
        }
    } else {
        warn!("MESSAGING_BOT_TOKEN not set, sends are dry-run");
        Arc::new(DryRunTransport::new())
    };
    if config.llm_api_key.is_none() {
        warn!("LLM_API_KEY not set, risk escalation will fall back to rules");
    }

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        blob,
        llm,
        messenger,
        extractors: Arc::new(Default::default()),
    };

    if cli.once {
        let processed = pipeline::drain_queue(&state).await?;
        info!(processed, "Queue drained, exiting");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker_handles = pipeline::spawn_workers(state.clone(), shutdown_rx.clone());

    // site adapters are plugged in by the deployment; with none registered
    // the scheduler idles and the queue still serves externally enqueued work
    let scheduler = Arc::new(Scheduler::new(state.clone()));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    info!("✅ Pipeline up; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = scheduler_handle.await;
    Ok(())
}
