//! Worker-side entry point, launched inside each scan container by the
//! dispatcher. Exits 0 when the scan reached a terminal record (or was
//! interrupted), non-zero when it could not.

use std::path::Path;
use std::sync::Arc;

use scanforge::agent::{AgentConfig, AgentExit, ScanAgent};
use scanforge::job::JobManager;
use scanforge::scanner::ScannerClient;
use scanforge::store::{JobStore, LibSqlJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AgentConfig::from_env()?;
    tracing::info!(
        job_id = %config.job_id,
        target = %config.target,
        level = config.level.as_str(),
        "Scan agent starting"
    );

    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlJobStore::new_local(Path::new(&config.db_path)).await?,
    );
    let manager = JobManager::new(store);
    let scanner = ScannerClient::new(config.scanner_base_url.clone(), config.scanner_api_key.clone())?;
    let agent = ScanAgent::new(config, manager, scanner);

    // The dispatcher stops this container with SIGTERM on cancellation; the
    // scan must not record a terminal state in that case, but the scanner
    // daemon still gets a shutdown request.
    let exit = tokio::select! {
        exit = agent.run() => exit,
        _ = sigterm() => {
            tracing::info!("Received stop signal, shutting the scanner down");
            agent.stop().await;
            AgentExit::Interrupted
        }
    };

    tracing::info!(?exit, "Scan agent done");
    std::process::exit(exit.code());
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not install SIGTERM handler");
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    if tokio::signal::ctrl_c().await.is_err() {
        futures::future::pending::<()>().await;
    }
}
