use thiserror::Error;

use shared_models::error::AppError;

use crate::models::SlotStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotTransitionError {
    #[error("Slot has not been released for booking yet")]
    NotReleased,

    #[error("Slot is already fully booked")]
    Full,

    #[error("Slot is closed ({0})")]
    Closed(SlotStatus),

    #[error("Slot has no bookings to cancel")]
    NoBookings,
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Persistence(String),

    #[error("Slot generation already running for doctor-branch {0}")]
    Busy(i64),

    #[error("Slot generation for doctor-branch {doctor_branch_id} exceeded {seconds} seconds")]
    Timeout { doctor_branch_id: i64, seconds: u64 },

    #[error("Lock backend error: {0}")]
    LockBackend(String),

    #[error("Invalid slot transition: {0}")]
    Transition(#[from] SlotTransitionError),
}

impl From<anyhow::Error> for ScheduleError {
    fn from(err: anyhow::Error) -> Self {
        ScheduleError::Persistence(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for ScheduleError {
    fn from(err: serde_json::Error) -> Self {
        ScheduleError::Persistence(format!("Malformed payload: {}", err))
    }
}

impl From<redis::RedisError> for ScheduleError {
    fn from(err: redis::RedisError) -> Self {
        ScheduleError::LockBackend(err.to_string())
    }
}

impl From<ScheduleError> for AppError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::NotFound(what) => AppError::NotFound(format!("{} not found", what)),
            ScheduleError::Validation(msg) => AppError::ValidationError(msg),
            ScheduleError::Persistence(msg) => AppError::Database(msg),
            ScheduleError::Busy(_) => AppError::Conflict(err.to_string()),
            ScheduleError::Timeout { .. } => AppError::Timeout(err.to_string()),
            ScheduleError::Transition(_) => AppError::Conflict(err.to_string()),
            ScheduleError::LockBackend(msg) => AppError::Internal(msg),
        }
    }
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;
