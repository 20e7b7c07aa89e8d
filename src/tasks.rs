//! Background jobs: WAL compaction and periodic booking statistics.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::{BookingApi, BookingStats};
use crate::store::WalStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Rewrite the WAL whenever it has grown by `threshold` appends since the last rewrite.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, cancel: CancellationToken) {
    run_compactor_every(store, threshold, COMPACT_CHECK_INTERVAL, cancel).await
}

async fn run_compactor_every(
    store: Arc<WalStore>,
    threshold: u64,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("compactor stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = compact_if_due(&store, threshold).await {
                    error!(error = %e, "WAL compaction failed");
                }
            }
        }
    }
}

/// Returns the number of bookings written when a compaction ran.
pub async fn compact_if_due(
    store: &WalStore,
    threshold: u64,
) -> Result<Option<usize>, crate::engine::EngineError> {
    let appends = store.appends_since_compact().await?;
    if appends < threshold {
        return Ok(None);
    }
    let written = store.compact().await?;
    info!(appends, bookings = written, "WAL compacted");
    Ok(Some(written))
}

/// Log and publish booking counts every `period`, reading through the API.
pub async fn run_stats(api: Arc<BookingApi>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stats worker stopping");
                break;
            }
            _ = interval.tick() => {
                match api.stats().await {
                    Ok(stats) => publish_stats(&stats),
                    Err(e) => error!(error = %e, "stats collection failed"),
                }
            }
        }
    }
}

pub fn publish_stats(stats: &BookingStats) {
    metrics::gauge!(crate::observability::BOOKINGS_TOTAL).set(stats.total as f64);
    metrics::gauge!(crate::observability::BOOKINGS_ACTIVE).set(stats.active as f64);
    info!(
        total = stats.total,
        active = stats.active,
        pending = stats.pending,
        confirmed = stats.confirmed,
        cancelled = stats.cancelled,
        resources = stats.resources,
        requesters = stats.requesters,
        "booking stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::OpenDirectory;
    use crate::engine::{Deadline, Engine};
    use crate::model::ReservationRequest;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_tasks");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn fill(engine: &Engine, n: i64) {
        let rid = Ulid::new();
        for i in 0..n {
            let request = ReservationRequest {
                requester_id: Ulid::new(),
                resource_id: rid,
                start: 1_000 + i * 100,
                end: 1_000 + i * 100 + 50,
            };
            engine.reserve(request, Deadline::none()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let engine = Engine::new(store.clone(), Arc::new(OpenDirectory));
        fill(&engine, 5).await;

        assert_eq!(compact_if_due(&store, 10).await.unwrap(), None);
        assert_eq!(compact_if_due(&store, 5).await.unwrap(), Some(5));
        assert_eq!(store.appends_since_compact().await.unwrap(), 0);
        assert_eq!(compact_if_due(&store, 5).await.unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compactor_task_runs_and_stops() {
        let path = test_wal_path("task.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let engine = Engine::new(store.clone(), Arc::new(OpenDirectory));
        fill(&engine, 3).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_compactor_every(
            store.clone(),
            1,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        let mut compacted = false;
        for _ in 0..100 {
            if store.appends_since_compact().await.unwrap() == 0 {
                compacted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(compacted);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.booking_count(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn stats_worker_stops_on_cancel() {
        let engine = Engine::new(
            Arc::new(crate::store::MemoryStore::new()),
            Arc::new(OpenDirectory),
        );
        fill(&engine, 2).await;
        let api = Arc::new(BookingApi::new(Arc::new(engine), Duration::from_secs(1)));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_stats(api.clone(), Duration::from_millis(5), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        let stats = api.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 2);
    }
}
