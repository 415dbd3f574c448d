//! adserve: ad selection and event tracking server
//! Serve: cached campaigns → targeting → pacing → eCPM ranking
//! Track: dedup → GIVT/SIVT → atomic budget ledger → attribution

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adserve_backend::{
    api::{create_router, AppState},
    config::PipelineConfig,
    fraud::{FraudScorer, HttpFraudScorer},
    keystore::{KeyStore, MemoryKeyStore, SqliteKeyStore},
    matching::MatchingOrchestrator,
    scheduler::{spawn_default_tasks, Scheduler},
    store::AdStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KeyStoreKind {
    /// Process-local; fine for a single instance
    Memory,
    /// Shared `kv` table in the SQLite database
    Sqlite,
}

#[derive(Debug, Parser)]
#[command(name = "adserve", version, about = "Ad serving and event tracking server")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// SQLite database file
    #[arg(long, env = "DB_PATH", default_value = "adserve.db")]
    db_path: String,

    /// Backend for TTL keys and counters
    #[arg(long, env = "KEYSTORE", value_enum, default_value_t = KeyStoreKind::Memory)]
    keystore: KeyStoreKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();
    let args = Args::parse();

    info!("🚀 adserve starting");

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let config = PipelineConfig::from_env();
    let store = AdStore::new(&args.db_path)?;

    let keystore: Arc<dyn KeyStore> = match args.keystore {
        KeyStoreKind::Memory => Arc::new(MemoryKeyStore::new()),
        KeyStoreKind::Sqlite => Arc::new(SqliteKeyStore::new(&args.db_path)?),
    };
    info!("🔑 Keystore: {:?}", args.keystore);

    let scorer = HttpFraudScorer::from_config(&config.fraud)?
        .map(|s| Arc::new(s) as Arc<dyn FraudScorer>);
    if scorer.is_none() {
        warn!("⚠️ FRAUD_API_URL not set, SIVT scoring disabled (events score neutral)");
    }

    let orchestrator = Arc::new(MatchingOrchestrator::new(
        store,
        keystore.clone(),
        scorer,
        config,
    ));

    let mut scheduler = Scheduler::new();
    spawn_default_tasks(&mut scheduler, keystore, orchestrator.clone());
    info!("⏱️ Background tasks: {}", scheduler.task_names().join(", "));

    let app = create_router(AppState::new(orchestrator).with_metrics(metrics_handle));

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    scheduler.shutdown().await;
    info!("👋 adserve stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adserve_backend=debug,adserve=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv();

    // Also accept a .env beside the manifest when launched from elsewhere.
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
