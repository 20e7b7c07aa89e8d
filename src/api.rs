//! Booking lifecycle boundary: wire shapes in, engine calls, wire views out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{Deadline, Engine, EngineError};
use crate::model::*;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("requester not found: {0}")]
    RequesterNotFound(RequesterId),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    /// HTTP-style status for the boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::RequesterNotFound(_) => 404,
            ApiError::Engine(e) => match e {
                EngineError::InvalidInterval { .. } | EngineError::LimitExceeded(_) => 400,
                EngineError::ResourceNotFound(_) | EngineError::NotFound(_) => 404,
                EngineError::BookingConflict { .. } | EngineError::InvalidTransition { .. } => 409,
                EngineError::StorageFailure(_) | EngineError::Timeout => 500,
            },
        }
    }

    /// Stable snake_case tag clients can branch on.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::RequesterNotFound(_) => "requester_not_found",
            ApiError::Engine(e) => e.label(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveBody {
    pub requester_id: String,
    pub resource_id: String,
    /// RFC 3339.
    pub start: String,
    /// RFC 3339.
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingView {
    pub id: BookingId,
    pub requester_id: RequesterId,
    pub resource_id: ResourceId,
    pub start: String,
    pub end: String,
    pub status: BookingStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Booking> for BookingView {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            requester_id: b.requester_id,
            resource_id: b.resource_id,
            start: format_instant(b.span.start),
            end: format_instant(b.span.end),
            status: b.status,
            created_at: format_instant(b.created_at),
            updated_at: format_instant(b.updated_at),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingStats {
    pub total: usize,
    pub active: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub cancelled: usize,
    pub resources: usize,
    pub requesters: usize,
}

impl BookingStats {
    pub fn tally(bookings: &[Booking]) -> Self {
        let mut stats = Self {
            total: bookings.len(),
            ..Self::default()
        };
        let mut resources = std::collections::HashSet::new();
        let mut requesters = std::collections::HashSet::new();
        for b in bookings {
            match b.status {
                BookingStatus::Pending => stats.pending += 1,
                BookingStatus::Confirmed => stats.confirmed += 1,
                BookingStatus::Cancelled => stats.cancelled += 1,
            }
            if b.is_active() {
                stats.active += 1;
            }
            resources.insert(b.resource_id);
            requesters.insert(b.requester_id);
        }
        stats.resources = resources.len();
        stats.requesters = requesters.len();
        stats
    }
}

/// The entry point external callers use. Every call runs under a fresh deadline.
pub struct BookingApi {
    engine: Arc<Engine>,
    request_timeout: Duration,
}

impl BookingApi {
    pub fn new(engine: Arc<Engine>, request_timeout: Duration) -> Self {
        Self {
            engine,
            request_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.request_timeout)
    }

    pub async fn reserve(&self, body: ReserveBody) -> Result<BookingView, ApiError> {
        let requester_id = parse_id("requester_id", &body.requester_id)?;
        let resource_id = parse_id("resource_id", &body.resource_id)?;
        let start = parse_instant("start", &body.start)?;
        let end = parse_instant("end", &body.end)?;

        let deadline = self.deadline();
        let known = deadline
            .run(self.engine.directory().requester_exists(requester_id))
            .await?;
        if !known {
            return Err(ApiError::RequesterNotFound(requester_id));
        }

        let request = ReservationRequest {
            requester_id,
            resource_id,
            start,
            end,
        };
        let booking = self.engine.reserve(request, deadline).await?;
        Ok(BookingView::from(&booking))
    }

    pub async fn get(&self, id: &str) -> Result<BookingView, ApiError> {
        let id = parse_id("id", id)?;
        let booking = self.engine.get(id, self.deadline()).await?;
        Ok(BookingView::from(&booking))
    }

    /// Cancel and return the booking as stored afterwards.
    pub async fn cancel(&self, id: &str) -> Result<BookingView, ApiError> {
        let id = parse_id("id", id)?;
        self.engine.cancel(id, self.deadline()).await?;
        // The cancel has committed; the read-back gets its own budget.
        let booking = self.engine.get(id, self.deadline()).await?;
        Ok(BookingView::from(&booking))
    }

    pub async fn confirm(&self, id: &str) -> Result<BookingView, ApiError> {
        let id = parse_id("id", id)?;
        let booking = self.engine.confirm(id, self.deadline()).await?;
        Ok(BookingView::from(&booking))
    }

    pub async fn list_for_requester(&self, requester_id: &str) -> Result<Vec<BookingView>, ApiError> {
        let requester_id = parse_id("requester_id", requester_id)?;
        let bookings = self
            .engine
            .list_for_requester(requester_id, self.deadline())
            .await?;
        Ok(views(&bookings))
    }

    pub async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<BookingView>, ApiError> {
        let resource_id = parse_id("resource_id", resource_id)?;
        let bookings = self
            .engine
            .list_for_resource(resource_id, self.deadline())
            .await?;
        Ok(views(&bookings))
    }

    pub async fn list_all(&self) -> Result<Vec<BookingView>, ApiError> {
        let bookings = self.engine.list_all(self.deadline()).await?;
        Ok(views(&bookings))
    }

    pub async fn stats(&self) -> Result<BookingStats, ApiError> {
        let bookings = self.engine.list_all(self.deadline()).await?;
        Ok(BookingStats::tally(&bookings))
    }
}

fn views(bookings: &[Booking]) -> Vec<BookingView> {
    bookings.iter().map(BookingView::from).collect()
}

pub fn parse_id(field: &str, raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw.trim())
        .map_err(|e| ApiError::BadRequest(format!("invalid {field} {raw:?}: {e}")))
}

/// RFC 3339 with any offset, to Unix milliseconds.
pub fn parse_instant(field: &str, raw: &str) -> Result<Ms, ApiError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| ApiError::BadRequest(format!("invalid {field} {raw:?}: {e}")))
}

/// Unix milliseconds to RFC 3339 UTC with millisecond precision.
pub fn format_instant(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}
