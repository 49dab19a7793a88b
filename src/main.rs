use std::path::Path;
use std::sync::Arc;

use scanforge::bridge::{Bridge, HttpSyncTarget};
use scanforge::config::OrchestratorConfig;
use scanforge::dispatch::{Dispatcher, DockerRuntime};
use scanforge::intake::Intake;
use scanforge::job::JobManager;
use scanforge::store::{JobStore, LibSqlJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env();

    eprintln!("🛰  scanforge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Workers: {} concurrent, queue of {}",
        config.max_concurrent,
        config.queue_capacity()
    );
    eprintln!("   Worker image: {}", config.worker_image);
    eprintln!("   Database: {}", config.db_path);

    // ── Job store ────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlJobStore::new_local(Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open job store at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );
    let manager = JobManager::new(store);

    // ── Bridge ───────────────────────────────────────────────────────────
    let bridge = config.bridge_endpoint.clone().map(|endpoint| {
        eprintln!("   Bridge: {endpoint}");
        Arc::new(Bridge::new(
            Box::new(HttpSyncTarget::new(endpoint)),
            config.bridge_max_attempts,
            config.bridge_base_delay,
        ))
    });
    if bridge.is_none() {
        eprintln!("   Bridge: disabled");
    }

    // ── Dispatcher ───────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(
        config.clone(),
        manager.clone(),
        Arc::new(DockerRuntime::new()),
        bridge,
    );

    // ── Startup recovery + store intake ──────────────────────────────────
    let intake = Intake::new(manager, Arc::clone(&dispatcher), config.intake_interval);
    intake.recover().await;
    let intake_handle = tokio::spawn(intake.run());

    tracing::info!("scanforge running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    intake_handle.abort();
    dispatcher.shutdown().await;
    Ok(())
}
