use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::engine::EngineError;
use crate::model::*;
use crate::wal::Wal;

use super::{BookingStore, MemoryStore};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compacting or reporting counts.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break, // channel empty, flush batch
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut failure: Option<io::Error> = None;
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            failure = Some(e);
            break;
        }
    }
    if failure.is_none() {
        failure = wal.flush_sync().err();
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    // Every sender is about to hear Err, so none of the batch may survive a replay.
    if let Some(e) = &failure {
        tracing::error!(batch = batch.len(), "WAL commit failed: {e}");
        if let Err(rollback) = wal.rollback() {
            tracing::error!("WAL rollback failed, appends refused until compaction: {rollback}");
        }
    }
    for (_, tx) in batch {
        let r = match &failure {
            None => Ok(()),
            Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Handle to the WAL writer task.
pub(crate) struct Journal {
    tx: mpsc::Sender<WalCommand>,
}

impl Journal {
    fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))
    }

    /// Append one event; resolves once its batch is fsynced.
    pub(crate) async fn append(&self, event: &Event) -> Result<(), EngineError> {
        self.request(|response| WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?
        .map_err(EngineError::from)
    }

    async fn compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        self.request(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(EngineError::from)
    }

    async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        self.request(|response| WalCommand::AppendsSinceCompact { response })
            .await
    }
}

/// Booking store persisted through a write-ahead log.
///
/// Every mutation is journaled before it becomes visible in the in-memory state,
/// so a failed append leaves no trace. Opening the store replays the log.
pub struct WalStore {
    state: MemoryStore,
    journal: Journal,
    /// Mutations hold this shared; compaction holds it exclusive so the
    /// snapshot and the log swap see the same state.
    compaction: RwLock<()>,
}

impl WalStore {
    /// Replay `path`, cut off any damaged tail and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let replay = Wal::recover(path)?;
        let state = MemoryStore::new();
        state.replay(&replay.events)?;
        let wal = Wal::open(path)?;
        tracing::info!(
            path = %path.display(),
            events = replay.events.len(),
            bookings = state.booking_count(),
            "booking journal replayed"
        );
        Ok(Self {
            state,
            journal: Journal::spawn(wal),
            compaction: RwLock::new(()),
        })
    }

    /// Rewrite the log as one `BookingCreated` per booking, carrying its current status.
    pub async fn compact(&self) -> Result<usize, EngineError> {
        let _exclusive = self.compaction.write().await;
        let events = self.state.snapshot().await;
        let count = events.len();
        self.journal.compact(events).await?;
        Ok(count)
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        self.journal.appends_since_compact().await
    }

    pub fn booking_count(&self) -> usize {
        self.state.booking_count()
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn create(&self, booking: NewBooking) -> Result<Booking, EngineError> {
        let _shared = self.compaction.read().await;
        self.state.create_with(booking, Some(&self.journal)).await
    }

    async fn get_by_id(&self, id: BookingId) -> Result<Option<Booking>, EngineError> {
        self.state.get_by_id(id).await
    }

    async fn update_status(
        &self,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let _shared = self.compaction.read().await;
        self.state
            .update_status_with(id, status, Some(&self.journal))
            .await
    }

    async fn find_conflict(
        &self,
        resource_id: ResourceId,
        span: Span,
    ) -> Result<Option<BookingId>, EngineError> {
        self.state.find_conflict(resource_id, span).await
    }

    async fn list_by_resource(&self, resource_id: ResourceId) -> Result<Vec<Booking>, EngineError> {
        self.state.list_by_resource(resource_id).await
    }

    async fn list_by_requester(
        &self,
        requester_id: RequesterId,
    ) -> Result<Vec<Booking>, EngineError> {
        self.state.list_by_requester(requester_id).await
    }

    async fn list_all(&self) -> Result<Vec<Booking>, EngineError> {
        self.state.list_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_wal_store");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn new_booking(resource_id: ResourceId, start: Ms, end: Ms) -> NewBooking {
        NewBooking {
            requester_id: Ulid::new(),
            resource_id,
            span: Span::new(start, end),
        }
    }

    #[tokio::test]
    async fn reopen_replays_bookings_and_statuses() {
        let path = test_wal_path("reopen.wal");
        let rid = Ulid::new();

        let (kept, cancelled) = {
            let store = WalStore::open(&path).unwrap();
            let kept = store.create(new_booking(rid, 0, 100)).await.unwrap();
            let cancelled = store.create(new_booking(rid, 100, 200)).await.unwrap();
            store
                .update_status(cancelled.id, BookingStatus::Cancelled)
                .await
                .unwrap();
            (kept, cancelled)
        };

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.booking_count(), 2);
        assert_eq!(store.get_by_id(kept.id).await.unwrap(), Some(kept.clone()));
        let reloaded = store.get_by_id(cancelled.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BookingStatus::Cancelled);

        // The cancelled slot stays free after restart, the kept one does not.
        assert!(!store.has_conflict(rid, Span::new(100, 200)).await.unwrap());
        assert_eq!(
            store.find_conflict(rid, Span::new(50, 60)).await.unwrap(),
            Some(kept.id)
        );
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn torn_tail_is_ignored_on_open() {
        let path = test_wal_path("torn.wal");
        let rid = Ulid::new();
        {
            let store = WalStore::open(&path).unwrap();
            store.create(new_booking(rid, 0, 10)).await.unwrap();
        }
        {
            let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFF, 0x00, 0x00]).unwrap();
        }

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list_all().await.unwrap().len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn bookings_written_after_torn_tail_survive_next_restart() {
        let path = test_wal_path("torn_then_write.wal");
        let rid = Ulid::new();
        {
            let store = WalStore::open(&path).unwrap();
            store.create(new_booking(rid, 0, 10)).await.unwrap();
        }
        {
            let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFF, 0x00, 0x00]).unwrap();
        }

        let later = {
            let store = WalStore::open(&path).unwrap();
            store.create(new_booking(rid, 100, 200)).await.unwrap()
        };

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.booking_count(), 2);
        assert_eq!(store.get_by_id(later.id).await.unwrap(), Some(later.clone()));
        assert_eq!(
            store.find_conflict(rid, Span::new(150, 160)).await.unwrap(),
            Some(later.id)
        );
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn failed_batch_leaves_nothing_to_replay() {
        let path = test_wal_path("failed_batch.wal");
        let rid = Ulid::new();
        let booked = {
            let store = WalStore::open(&path).unwrap();
            store.create(new_booking(rid, 0, 10)).await.unwrap()
        };

        let mut wal = Wal::open(&path).unwrap();
        let mut receivers = Vec::new();
        let batch = [(20, 30), (40, 50)]
            .into_iter()
            .map(|(start, end)| {
                let (tx, rx) = oneshot::channel();
                receivers.push(rx);
                let booking = Booking {
                    id: Ulid::new(),
                    requester_id: Ulid::new(),
                    resource_id: rid,
                    span: Span::new(start, end),
                    status: BookingStatus::Pending,
                    created_at: 1,
                    updated_at: 1,
                };
                (Event::BookingCreated { booking }, tx)
            })
            .collect();
        wal.fail_next_sync();
        commit_batch(&mut wal, batch);
        for rx in receivers {
            assert!(rx.await.unwrap().is_err());
        }
        drop(wal);

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list_all().await.unwrap(), vec![booked]);
        assert!(!store.has_conflict(rid, Span::new(20, 50)).await.unwrap());
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compact.wal");
        let rid = Ulid::new();
        let before = {
            let store = WalStore::open(&path).unwrap();
            for i in 0..10 {
                let b = store.create(new_booking(rid, i * 100, i * 100 + 50)).await.unwrap();
                if i % 2 == 0 {
                    store.update_status(b.id, BookingStatus::Confirmed).await.unwrap();
                    store.update_status(b.id, BookingStatus::Cancelled).await.unwrap();
                }
            }
            assert_eq!(store.appends_since_compact().await.unwrap(), 20);
            let size_before = fs::metadata(&path).unwrap().len();

            assert_eq!(store.compact().await.unwrap(), 10);
            assert_eq!(store.appends_since_compact().await.unwrap(), 0);
            assert!(fs::metadata(&path).unwrap().len() < size_before);

            store.create(new_booking(rid, 5000, 6000)).await.unwrap();
            store.list_all().await.unwrap()
        };

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list_all().await.unwrap(), before);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn invalid_transition_is_not_journaled() {
        let path = test_wal_path("invalid_transition.wal");
        let rid = Ulid::new();
        let id = {
            let store = WalStore::open(&path).unwrap();
            let b = store.create(new_booking(rid, 0, 10)).await.unwrap();
            store.update_status(b.id, BookingStatus::Cancelled).await.unwrap();
            let err = store.update_status(b.id, BookingStatus::Confirmed).await;
            assert!(matches!(err, Err(EngineError::InvalidTransition { .. })));
            assert_eq!(store.appends_since_compact().await.unwrap(), 2);
            b.id
        };

        let store = WalStore::open(&path).unwrap();
        assert_eq!(
            store.get_by_id(id).await.unwrap().unwrap().status,
            BookingStatus::Cancelled
        );
        let _ = fs::remove_file(&path);
    }
}
