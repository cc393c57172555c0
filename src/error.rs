//! Error taxonomy for the settlement workflow.
//!
//! Every failure a caller can see falls into one of five buckets:
//! validation (nothing changed), conflict (someone else settled first),
//! partial write (the finalize transaction failed part-way), dependency
//! (store or renderer unavailable) and not-found.

use serde::Serialize;
use thiserror::Error;

/// Which way a line's bucket total misses the delivered quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delta {
    Over,
    Under,
}

/// Input errors. Reported to the caller, no state change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(
        "Quantity mismatch for booking item {booking_item_id}: delivered {delivered}, \
         accounted {accounted} ({delta:?} by {difference})"
    )]
    QuantityMismatch {
        booking_item_id: String,
        delivered: u32,
        accounted: u64,
        delta: Delta,
        difference: u64,
    },

    #[error("Negative quantity for {field} on booking item {booking_item_id}: {value}")]
    NegativeQuantity {
        booking_item_id: String,
        field: &'static str,
        value: i64,
    },

    #[error(
        "Delivered quantity for booking item {booking_item_id} is {expected}, \
         request claims {claimed}"
    )]
    DeliveredQuantityAltered {
        booking_item_id: String,
        expected: u32,
        claimed: i64,
    },

    #[error("Booking item {0} is not part of this booking")]
    UnknownBookingItem(String),

    #[error("Booking item {0} appears more than once")]
    DuplicateLine(String),

    #[error("No return line for delivered booking item {0}")]
    MissingLine(String),

    #[error("Fee override names product {0}, which is not in this booking")]
    UnknownOverrideProduct(String),

    #[error("Invalid fee for product {product_id}: {reason}")]
    InvalidFee { product_id: String, reason: String },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// Another writer already settled the booking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Settlement already finalized for booking {0}")]
    AlreadySettled(String),

    #[error("Booking {0} was settled by a concurrent request")]
    RaceLost(String),

    #[error("Booking {booking_id} is {status}, returns need a delivered booking")]
    NotDelivered { booking_id: String, status: String },
}

/// A line the item router could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineFailure {
    pub booking_item_id: String,
    pub product_id: String,
    pub table: &'static str,
    pub reason: String,
}

/// The finalize transaction failed after some sub-writes had run.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[error(
    "Settlement for booking {booking_id} failed at step '{failed_step}' \
     ({} write(s) applied before the failure, rolled back: {rolled_back})",
    .applied.len()
)]
pub struct PartialWriteError {
    pub booking_id: String,
    pub failed_step: String,
    pub applied: Vec<String>,
    pub failed_lines: Vec<LineFailure>,
    pub rolled_back: bool,
    pub cause: String,
}

/// Top-level error for settlement operations.
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("{0}")]
    PartialWrite(#[from] PartialWriteError),

    #[error("Dependency unavailable: {0}")]
    Dependency(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl SettlementError {
    /// Stable machine-readable code for API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(ValidationError::QuantityMismatch { .. }) => "QUANTITY_MISMATCH",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(ConflictError::AlreadySettled(_)) => "ALREADY_SETTLED",
            Self::Conflict(ConflictError::RaceLost(_)) => "SETTLEMENT_RACE_LOST",
            Self::Conflict(ConflictError::NotDelivered { .. }) => "NOT_DELIVERED",
            Self::PartialWrite(_) => "PARTIAL_WRITE",
            Self::Dependency(_) => "DEPENDENCY_UNAVAILABLE",
            Self::NotFound(_) => "NOT_FOUND",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for SettlementError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Dependency(format!("sqlite: {e}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for SettlementError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Dependency(format!("database lock poisoned: {e}"))
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;
