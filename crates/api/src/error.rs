//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::CheckoutError;
use domain::{DomainError, OrderError};
use event_store::EventStoreError;
use events::DeliveryError;
use inventory::{LedgerError, LockError};
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Checkout(CheckoutError),
    Ledger(LedgerError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Checkout(err) => checkout_status(err),
            ApiError::Ledger(err) => ledger_status(err),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) => msg.clone(),
            ApiError::Checkout(err) => err.to_string(),
            ApiError::Ledger(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn checkout_status(err: &CheckoutError) -> StatusCode {
    match err {
        CheckoutError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        CheckoutError::Domain(err) => domain_status(err),
        CheckoutError::Ledger(err) => ledger_status(err),
        CheckoutError::Lock(LockError::Unavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        CheckoutError::Lock(LockError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        CheckoutError::Gateway(_) => StatusCode::BAD_GATEWAY,
    }
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        DomainError::Order(order_err) => match order_err {
            OrderError::NotPlaced => StatusCode::NOT_FOUND,
            OrderError::AlreadyPlaced
            | OrderError::InvalidStateTransition { .. }
            | OrderError::ReservationMismatch { .. }
            | OrderError::PaymentRefMismatch { .. } => StatusCode::CONFLICT,
            OrderError::NoItems
            | OrderError::InvalidQuantity { .. }
            | OrderError::InvalidPrice { .. }
            | OrderError::ConflictingPrices { .. }
            | OrderError::AmountOverflow => StatusCode::BAD_REQUEST,
        },
        DomainError::AggregateNotFound { .. } => StatusCode::NOT_FOUND,
        DomainError::EventStore(EventStoreError::ConcurrencyConflict { .. }) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::LockUnavailable { .. } | LedgerError::VersionConflict { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LedgerError::InsufficientStock { .. } | LedgerError::ReservationExpired { .. } => {
            StatusCode::CONFLICT
        }
        LedgerError::ReservationNotFound(_) | LedgerError::ProductNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        LedgerError::InvalidQuantity(_) => StatusCode::BAD_REQUEST,
        LedgerError::Lock(_) | LedgerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Checkout(err)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Ledger(err)
    }
}

/// Failures while bringing the process up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migrations failed: {0}")]
    Migrations(#[from] EventStoreError),

    #[error("Collaborator setup failed: {0}")]
    Collaborator(#[from] DeliveryError),
}
