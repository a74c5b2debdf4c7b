use ulid::Ulid;

use crate::model::{BookingCode, ReservationStatus, Role, TimeOfDay};

use super::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("slot {start} on {date} is already booked for {resource_id}")]
    Conflict {
        resource_id: String,
        date: String,
        start: TimeOfDay,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("contact does not match reservation {0}")]
    ContactMismatch(BookingCode),
    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("no free booking code after {0} attempts")]
    CodeExhaustion(u32),
    #[error("{role} may not move a reservation to {to}")]
    Forbidden { role: Role, to: ReservationStatus },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("reservation store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn reservation_not_found(id: Ulid) -> Self {
        EngineError::NotFound(format!("reservation {id}"))
    }

    /// Only a conflict is worth retrying, and only after picking another slot.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::reservation_not_found(id),
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
            StoreError::Wal(msg) => EngineError::WalError(msg),
            other => EngineError::Internal(other.to_string()),
        }
    }
}
