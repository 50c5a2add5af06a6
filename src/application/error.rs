use thiserror::Error;

use crate::domain::{AggregateError, BillId, BillValidationError, ShareError, UserId};
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid bill: {0}")]
    Validation(#[from] BillValidationError),

    #[error("Bill not found: {0}")]
    BillNotFound(BillId),

    #[error("{participant_id} is not a split participant of bill {bill_id}")]
    NoSuchParticipant {
        bill_id: BillId,
        participant_id: UserId,
    },

    #[error("Only the creator can delete bill {bill_id} (requested by {requester_id})")]
    Forbidden {
        bill_id: BillId,
        requester_id: UserId,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] ShareError),

    #[error("Invalid period: {year}-{month:02}")]
    InvalidPeriod { year: i32, month: u32 },

    #[error("Totals for {year}-{month:02} are too large to compute")]
    AggregateOverflow { year: i32, month: u32 },

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Store unavailable, try again: {0}")]
    StoreUnavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AppError {
    /// Only transient store failures are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => AppError::StoreUnavailable(reason),
            StoreError::Backend(err) => AppError::Store(err),
        }
    }
}

impl From<AggregateError> for AppError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::InvalidPeriod { year, month } => AppError::InvalidPeriod { year, month },
            AggregateError::Overflow { year, month } => AppError::AggregateOverflow { year, month },
            AggregateError::Share(err) => AppError::InvalidAmount(err),
        }
    }
}
