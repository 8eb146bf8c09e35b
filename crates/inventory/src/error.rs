use common::{ProductId, ReservationId};
use thiserror::Error;

/// Errors from the lease service.
#[derive(Debug, Error)]
pub enum LockError {
    /// Every acquisition attempt found the lease held by someone else.
    #[error("Lease on '{resource_key}' unavailable after {attempts} attempts")]
    Unavailable { resource_key: String, attempts: u32 },

    /// The backing store failed.
    #[error("Lock backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Errors from a stock store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be mapped back to the model.
    #[error("Corrupt stock record: {0}")]
    Corrupt(String),

    /// A write would break `available >= reserved >= 0`.
    #[error("Stock invariant violated for product {0}")]
    InvariantViolation(ProductId),
}

/// Errors from the stock ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The product's lease could not be obtained within the retry bound.
    #[error("Lease on '{resource_key}' unavailable after {attempts} attempts")]
    LockUnavailable { resource_key: String, attempts: u32 },

    #[error("Insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// The stock row changed between read and write, even after a retry.
    #[error("Version conflict on product {product_id}")]
    VersionConflict { product_id: ProductId },

    /// A reservation was released, expired, or is past its window.
    #[error("Reservation {reservation_id} has expired")]
    ReservationExpired { reservation_id: ReservationId },

    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(u32),

    #[error("Lock backend error: {0}")]
    Lock(LockError),

    #[error("Stock store error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Lock and version conflicts may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::LockUnavailable { .. } | LedgerError::VersionConflict { .. }
        )
    }
}

impl From<LockError> for LedgerError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable {
                resource_key,
                attempts,
            } => LedgerError::LockUnavailable {
                resource_key,
                attempts,
            },
            other => LedgerError::Lock(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
