use thiserror::Error;

use crate::model::{BookingId, BookingStatus, Ms, ResourceId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval [{start}, {end}): start must be before end")]
    InvalidInterval { start: Ms, end: Ms },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),

    #[error("booking not found: {0}")]
    NotFound(BookingId),

    #[error("resource {resource_id} is already booked for that time (booking {existing})")]
    BookingConflict {
        resource_id: ResourceId,
        existing: BookingId,
    },

    #[error("booking {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("deadline exceeded")]
    Timeout,
}

impl EngineError {
    /// Infrastructure faults, as opposed to caller errors and business outcomes.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, EngineError::StorageFailure(_) | EngineError::Timeout)
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::ResourceNotFound(_) => "resource_not_found",
            EngineError::NotFound(_) => "not_found",
            EngineError::BookingConflict { .. } => "booking_conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::StorageFailure(_) => "storage_failure",
            EngineError::Timeout => "timeout",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::StorageFailure(e.to_string())
    }
}
