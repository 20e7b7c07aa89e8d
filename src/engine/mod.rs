mod conflict;
mod error;
mod locks;
mod mutations;
mod queries;

pub use conflict::overlapping_pair;
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use locks::LockTable;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::directory::Directory;
use crate::model::ResourceId;
use crate::store::BookingStore;

/// Point in time after which an operation gives up with [`EngineError::Timeout`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No bound.
    pub const fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail with `Timeout` unless there is time left.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_expired() {
            Err(EngineError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` until it completes or the deadline passes.
    pub async fn run<T, F>(self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match self.0 {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .unwrap_or(Err(EngineError::Timeout)),
        }
    }
}

/// The reservation conflict engine. The only component that creates, confirms
/// or cancels bookings.
///
/// Every write on a resource runs inside that resource's exclusive section, so
/// the conflict check and the insert that follows it are atomic with respect to
/// other writers on the same resource. Writers on different resources never wait
/// on each other. Reads bypass the lock table entirely.
pub struct Engine {
    store: Arc<dyn BookingStore>,
    directory: Arc<dyn Directory>,
    locks: LockTable,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            directory,
            locks: LockTable::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Enter the exclusive section for `resource_id`, waiting at most until `deadline`.
    async fn lock_resource(
        &self,
        resource_id: ResourceId,
        deadline: Deadline,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        let wait_start = std::time::Instant::now();
        let guard = deadline
            .run(async { Ok(self.locks.acquire(resource_id).await) })
            .await;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        guard
    }
}

/// Record outcome counters and latency for one engine operation.
fn observe<T>(op: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(crate::observability::ENGINE_OPERATIONS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(crate::observability::ENGINE_OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
