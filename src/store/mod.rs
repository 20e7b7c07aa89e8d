mod memory;
mod wal_store;

pub use memory::MemoryStore;
pub use wal_store::WalStore;

use async_trait::async_trait;

use crate::engine::EngineError;
use crate::model::*;

/// Durable keyed storage of bookings with a conflict-aware query surface.
///
/// Each call observes a consistent snapshot of the resource it touches. Making
/// `find_conflict` followed by `create` atomic is the caller's job.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Assign an id, stamp timestamps and persist as `pending`.
    async fn create(&self, booking: NewBooking) -> Result<Booking, EngineError>;

    async fn get_by_id(&self, id: BookingId) -> Result<Option<Booking>, EngineError>;

    /// Move a booking to `status`. Fails with `NotFound` for unknown ids and
    /// `InvalidTransition` when the state machine forbids the change.
    async fn update_status(
        &self,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<Booking, EngineError>;

    /// Id of an active booking on `resource_id` overlapping `span`.
    async fn find_conflict(
        &self,
        resource_id: ResourceId,
        span: Span,
    ) -> Result<Option<BookingId>, EngineError>;

    async fn has_conflict(&self, resource_id: ResourceId, span: Span) -> Result<bool, EngineError> {
        Ok(self.find_conflict(resource_id, span).await?.is_some())
    }

    /// Newest first.
    async fn list_by_resource(&self, resource_id: ResourceId) -> Result<Vec<Booking>, EngineError>;

    /// Newest first.
    async fn list_by_requester(
        &self,
        requester_id: RequesterId,
    ) -> Result<Vec<Booking>, EngineError>;

    /// Newest first.
    async fn list_all(&self) -> Result<Vec<Booking>, EngineError>;
}

/// Creation order, newest first. Ids are monotonic per store, so they break timestamp ties.
pub(crate) fn sort_newest_first(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}
