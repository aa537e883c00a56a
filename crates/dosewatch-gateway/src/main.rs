use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dosewatch_core::DosewatchConfig;
use dosewatch_scheduler::{
    AdherenceTracker, ExecutionRunner, LogNotifier, Notifier, ReminderStore, SchedulerEngine,
};
use tracing::{info, warn};

mod app;
mod http;
mod notify;

#[derive(Parser)]
#[command(name = "dosewatch-gateway")]
#[command(about = "Medication reminder scheduling service")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// Database file path (overrides config)
    #[arg(long)]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "dosewatch_gateway=info,dosewatch_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > DOSEWATCH_CONFIG env > ~/.dosewatch/dosewatch.toml
    let config_path = cli.config.or_else(|| std::env::var("DOSEWATCH_CONFIG").ok());
    let mut config = DosewatchConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        DosewatchConfig::default()
    });
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    // store and tracker each hold their own connection to the same file
    let store = Arc::new(
        ReminderStore::open(&db_path)?.with_claim_lease(config.scheduler.claim_lease_secs),
    );
    let tracker = AdherenceTracker::open(&db_path)?;

    let notifier: Arc<dyn Notifier> = match config.notifications.webhook_url.as_deref() {
        Some(url) => {
            info!(%url, "delivering notifications via webhook");
            Arc::new(notify::WebhookNotifier::new(
                url,
                Duration::from_millis(config.scheduler.notify_timeout_ms),
            ))
        }
        None => {
            info!("no webhook configured, notifications are logged only");
            Arc::new(LogNotifier)
        }
    };
    let runner = Arc::new(ExecutionRunner::new(
        store.clone(),
        notifier,
        config.scheduler.notify_timeout_ms,
    ));
    let engine = SchedulerEngine::new(store.clone(), runner.clone(), &config.scheduler);
    let worker_id = engine.worker_id().to_string();

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, store, tracker, runner, worker_id));
    let router = app::build_router(state);

    // spawn scheduler engine loop in background
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    info!("dosewatch gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // signal scheduler to stop and let the current tick finish
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!("scheduler task ended abnormally: {e}");
    }
    info!("dosewatch gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
