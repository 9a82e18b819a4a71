use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bundlebox::api::{self, AppState};
use bundlebox::config::Config;
use bundlebox::context::Runtime;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("Loading configuration");
    let config = Config::load().map_err(|e| format!("Failed to load config: {}", e))?;
    let address = address.unwrap_or(config.server.bind_addr);

    info!(path = %config.server.queue_path.display(), "Opening queue");
    let runtime =
        Runtime::open(config).map_err(|e| format!("Failed to open runtime: {}", e))?;
    runtime.recover().await?;

    let shutdown = CancellationToken::new();
    let workers = runtime.worker_pool()?.spawn(shutdown.clone());
    let purger = tokio::spawn(purge_loop(
        runtime.clone(),
        runtime.config.queue.retention(),
        shutdown.clone(),
    ));

    let state = AppState::new(&runtime);
    let signal = shutdown.clone();
    let served = api::serve(address, state, async move {
        shutdown_signal().await;
        signal.cancel();
    })
    .await;

    // Workers stop at their next await point; parts they held stay active
    // and are requeued on the next start.
    workers.shutdown().await;
    if let Err(e) = purger.await {
        warn!(error = %e, "Purge task ended abnormally");
    }
    runtime.queue.flush()?;
    info!("Queue flushed, bye");

    served?;
    Ok(())
}

async fn purge_loop(
    runtime: Runtime,
    retention: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match runtime.purge(retention).await {
            Ok(stats) if stats.bundles_pruned + stats.parts_pruned > 0 => {
                info!(
                    bundles = stats.bundles_pruned,
                    parts = stats.parts_pruned,
                    "Purged finished jobs"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Purge failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
