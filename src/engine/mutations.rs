use std::time::Instant;

use tracing::{debug, info};

use crate::model::*;

use super::conflict::validate_span;
use super::{observe, Deadline, Engine, EngineError};

impl Engine {
    /// Reserve `[start, end)` on a resource.
    ///
    /// Fails with `InvalidInterval` before touching storage, `ResourceNotFound` if
    /// the directory doesn't know the resource, and `BookingConflict` if an active
    /// booking overlaps. On any failure no booking exists for this attempt.
    pub async fn reserve(
        &self,
        request: ReservationRequest,
        deadline: Deadline,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(request, deadline).await;
        observe("reserve", started, &result);
        result
    }

    async fn reserve_inner(
        &self,
        request: ReservationRequest,
        deadline: Deadline,
    ) -> Result<Booking, EngineError> {
        let span = validate_span(request.start, request.end)?;
        let resource_id = request.resource_id;

        if !deadline
            .run(self.directory.resource_exists(resource_id))
            .await?
        {
            return Err(EngineError::ResourceNotFound(resource_id));
        }

        let _section = self.lock_resource(resource_id, deadline).await?;

        if let Some(existing) = deadline
            .run(self.store.find_conflict(resource_id, span))
            .await?
        {
            debug!(%resource_id, %existing, %span, "reservation rejected: overlap");
            return Err(EngineError::BookingConflict {
                resource_id,
                existing,
            });
        }

        // Past this point the write runs to completion; never start one late.
        deadline.check()?;
        let booking = self
            .store
            .create(NewBooking {
                requester_id: request.requester_id,
                resource_id,
                span,
            })
            .await?;

        // The booking is committed; an audit read failure must not turn into an Err.
        #[cfg(debug_assertions)]
        match self.store.list_by_resource(resource_id).await {
            Ok(on_resource) => debug_assert!(
                super::overlapping_pair(&on_resource).is_none(),
                "active bookings overlap on resource {resource_id}"
            ),
            Err(e) => tracing::warn!(%resource_id, "overlap audit skipped: {e}"),
        }

        info!(
            booking_id = %booking.id,
            %resource_id,
            requester_id = %booking.requester_id,
            %span,
            "booking reserved"
        );
        Ok(booking)
    }

    /// Cancel a booking. Cancelling an already-cancelled booking succeeds.
    pub async fn cancel(&self, id: BookingId, deadline: Deadline) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(id, deadline).await;
        observe("cancel", started, &result);
        result
    }

    async fn cancel_inner(&self, id: BookingId, deadline: Deadline) -> Result<(), EngineError> {
        let booking = deadline
            .run(self.store.get_by_id(id))
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            debug!(booking_id = %id, "cancel: already cancelled");
            return Ok(());
        }

        let _section = self.lock_resource(booking.resource_id, deadline).await?;

        // Re-read inside the section: a racing cancel may have won.
        let current = deadline
            .run(self.store.get_by_id(id))
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if current.status == BookingStatus::Cancelled {
            debug!(booking_id = %id, "cancel: already cancelled");
            return Ok(());
        }

        deadline.check()?;
        self.store
            .update_status(id, BookingStatus::Cancelled)
            .await?;
        info!(booking_id = %id, resource_id = %current.resource_id, "booking cancelled");
        Ok(())
    }

    /// Approval hook: move a pending booking to `confirmed`.
    pub async fn confirm(&self, id: BookingId, deadline: Deadline) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.confirm_inner(id, deadline).await;
        observe("confirm", started, &result);
        result
    }

    async fn confirm_inner(&self, id: BookingId, deadline: Deadline) -> Result<Booking, EngineError> {
        let booking = deadline
            .run(self.store.get_by_id(id))
            .await?
            .ok_or(EngineError::NotFound(id))?;

        let _section = self.lock_resource(booking.resource_id, deadline).await?;
        deadline.check()?;
        let confirmed = self
            .store
            .update_status(id, BookingStatus::Confirmed)
            .await?;
        info!(booking_id = %id, resource_id = %confirmed.resource_id, "booking confirmed");
        Ok(confirmed)
    }
}
