use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use recap_core::gateway::{CallOptions, GatewayConfig, ModelGateway};
use recap_core::{JobQueue, PgJobQueue, PgSummaryStore, RecapConfig, RecapError};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::{fmt, EnvFilter};

use recap_server::subsystems::processor::SummaryProcessor;
use recap_server::subsystems::worker::Worker;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "recap.toml")]
    config: String,

    #[arg(long)]
    health: bool,

    /// Overrides `[queue] workers`.
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match RecapConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Connect to DB
    let pool = match recap_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match recap_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match recap_core::db::check_schema(&pool).await {
            Ok(true) => println!("✅ summaries and summary_jobs tables present"),
            Ok(false) => {
                println!("❌ summaries / summary_jobs tables missing");
                std::process::exit(1);
            }
            Err(e) => {
                println!("❌ Schema check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Recap DB health check passed");
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let worker_count = args.workers.unwrap_or(config.queue.workers).max(1);
    let handles = spawn_workers(&config, pool, worker_count, &tx).await?;
    tracing::info!(workers = worker_count, "Recap server running");

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Recap server stopped");
    Ok(())
}

/// Wire gateway, store and queue, then start `count` workers.
async fn spawn_workers(
    config: &RecapConfig,
    pool: PgPool,
    count: usize,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>, RecapError> {
    let version = recap_core::db::health_check(&pool).await?;
    tracing::debug!(%version, "PostgreSQL connected");

    let gateway = ModelGateway::new(GatewayConfig::from_model_config(&config.model))?;
    tracing::info!(
        bases = ?gateway.candidate_bases(),
        model = %config.model.default_model,
        "Model gateway ready"
    );

    let store = Arc::new(PgSummaryStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(
        pool,
        Duration::from_millis(config.queue.lease_ms),
    ));
    let backlog = queue.depth().await?;
    tracing::info!(waiting = backlog.waiting, active = backlog.active, "Queue backlog at startup");

    let processor = Arc::new(SummaryProcessor::new(
        store,
        Arc::new(gateway),
        CallOptions::from(&config.model),
        config.pipeline.on_parse_failure,
    ));

    let poll_interval = Duration::from_millis(config.queue.poll_interval_ms);
    let handles = (0..count)
        .map(|id| {
            let worker = Worker::new(id, queue.clone(), processor.clone(), poll_interval);
            tokio::spawn(worker.run(shutdown.subscribe()))
        })
        .collect();
    Ok(handles)
}
