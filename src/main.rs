use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use slotkeeper::api::BookingApi;
use slotkeeper::config::Config;
use slotkeeper::directory::{Directory, OpenDirectory, StaticDirectory};
use slotkeeper::engine::Engine;
use slotkeeper::store::WalStore;
use slotkeeper::{observability, tasks, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(WalStore::open(&config.wal_path())?);

    let directory: Arc<dyn Directory> =
        if config.resources.is_none() && config.requesters.is_none() {
            Arc::new(OpenDirectory)
        } else {
            Arc::new(StaticDirectory::seeded(
                config.resources.clone(),
                config.requesters.clone(),
            ))
        };

    let engine = Arc::new(Engine::new(store.clone(), directory));
    let api = Arc::new(BookingApi::new(engine, config.request_timeout));

    let background = CancellationToken::new();
    let compactor = tokio::spawn(tasks::run_compactor(
        store.clone(),
        config.compact_threshold,
        background.clone(),
    ));
    let stats = tokio::spawn(tasks::run_stats(
        api.clone(),
        config.stats_interval,
        background.clone(),
    ));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotkeeper listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  request_timeout: {:?}", config.request_timeout);
    info!(
        "  directory: {}",
        if config.resources.is_some() || config.requesters.is_some() { "static" } else { "open" }
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    serve(listener, api, semaphore.clone(), shutdown_signal()?).await;
    drain(&semaphore, max_connections, Duration::from_secs(10)).await;

    background.cancel();
    let _ = tokio::join!(compactor, stats);
    if let Err(e) = tasks::compact_if_due(&store, 1).await {
        tracing::warn!("final compaction skipped: {e}");
    }

    info!("slotkeeper stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Accept connections until `shutdown` resolves. Each connection holds one permit.
async fn serve(
    listener: TcpListener,
    api: Arc<BookingApi>,
    permits: Arc<Semaphore>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("accept error: {e}");
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                return;
            }
        };

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            tracing::warn!(%peer, "connection limit reached, rejecting");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        tracing::debug!(%peer, "connection accepted");
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        let api = api.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = wire::process_connection(socket, api).await {
                tracing::warn!(%peer, "connection error: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }
}

/// Wait for every permit to come back, giving up after `limit`.
async fn drain(permits: &Semaphore, max_connections: usize, limit: Duration) {
    info!("draining connections...");
    let waited = tokio::time::timeout(limit, async {
        while permits.available_permits() < max_connections {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    match waited {
        Ok(()) => info!("all connections drained"),
        Err(_) => {
            let remaining = max_connections - permits.available_permits();
            tracing::warn!(remaining, "drain timeout, connections still open");
        }
    }
}
