use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type BookingId = Ulid;
pub type ResourceId = Ulid;
pub type RequesterId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from untrusted bounds. Zero-length and inverted pairs are rejected.
    pub fn try_new(start: Ms, end: Ms) -> Result<Self, EngineError> {
        let span = Self { start, end };
        if span.is_valid() {
            Ok(span)
        } else {
            Err(EngineError::InvalidInterval { start, end })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings are the ones that occupy their span.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        matches!(
            (self, to),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reservation of one resource by one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub requester_id: RequesterId,
    pub resource_id: ResourceId,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Inbound request to reserve `[start, end)`. Bounds are unchecked until the engine validates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationRequest {
    pub requester_id: RequesterId,
    pub resource_id: ResourceId,
    pub start: Ms,
    pub end: Ms,
}

/// A validated booking the store has not yet assigned an id to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub requester_id: RequesterId,
    pub resource_id: ResourceId,
    pub span: Span,
}

/// All bookings of one resource, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    pub resource_id: ResourceId,
    pub bookings: Vec<Booking>,
}

impl ResourceLedger {
    pub fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// First active booking overlapping `span`, if any.
    pub fn first_conflict(&self, span: &Span) -> Option<&Booking> {
        self.overlapping(span).find(|b| b.is_active())
    }
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    StatusChanged {
        id: BookingId,
        resource_id: ResourceId,
        status: BookingStatus,
        updated_at: Ms,
    },
}

impl Event {
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Event::BookingCreated { booking } => booking.resource_id,
            Event::StatusChanged { resource_id, .. } => *resource_id,
        }
    }
}
