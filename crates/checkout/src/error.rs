//! Checkout error types.

use common::AggregateId;
use domain::DomainError;
use inventory::{LedgerError, LockError};
use thiserror::Error;

/// Errors from the payment gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway could not be reached or timed out.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),

    /// The gateway refused to open an intent for this order.
    #[error("Payment gateway rejected the intent: {0}")]
    Rejected(String),
}

/// Errors from the cart collaborator.
#[derive(Debug, Error)]
pub enum CartError {
    #[error("Cart service unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur while driving an order through checkout.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// The order refused the transition, or its journal failed.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Stock ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The order's own lease could not be taken.
    #[error("Order lease error: {0}")]
    Lock(#[from] LockError),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl CheckoutError {
    /// Lease and version contention; the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            CheckoutError::Lock(LockError::Unavailable { .. }) => true,
            CheckoutError::Ledger(e) => e.is_transient(),
            CheckoutError::Domain(e) => e.is_conflict(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckoutError>;
