use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Turn raw bounds into a span the engine will accept.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// First pair of active bookings that overlap each other, if any.
/// A resource is consistent iff this returns `None` for its bookings.
pub fn overlapping_pair(bookings: &[Booking]) -> Option<(BookingId, BookingId)> {
    let mut active: Vec<&Booking> = bookings.iter().filter(|b| b.is_active()).collect();
    active.sort_by_key(|b| b.span.start);
    active
        .windows(2)
        .find(|w| w[0].span.overlaps(&w[1].span))
        .map(|w| (w[0].id, w[1].id))
}
