use bitredict_keeper::config::Config;
use bitredict_keeper::scheduler::Scheduler;
use bitredict_keeper::services::Services;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new("keeper.toml").exists() {
        Config::load(Path::new("keeper.toml"))?
    } else {
        Config::from_env()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("bitredict-keeper v{} starting", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    if !config.has_signer() {
        warn!("no PRIVATE_KEY configured, chain writes will fail");
    }

    let services = Arc::new(Services::connect(config).await?);
    info!(
        runner = %services.coordinator.runner_id(),
        "services connected"
    );

    // Locks left behind by a crashed process would otherwise block their
    // jobs until the TTL lapses on its own.
    match services.coordinator.cleanup_expired_locks().await {
        Ok(0) => {}
        Ok(n) => info!(expired = n, "startup lock cleanup"),
        Err(e) => warn!(error = %e, "startup lock cleanup failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(services.clone()));
    let handles = scheduler.spawn_all(shutdown_rx);
    info!(tasks = handles.len(), "scheduler running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(handles)).await {
        Ok(results) => {
            for e in results.into_iter().filter_map(|r| r.err()) {
                error!(error = %e, "task panicked during shutdown");
            }
        }
        Err(_) => warn!("tasks did not stop within 30s"),
    }

    info!("stopped");
    Ok(())
}
