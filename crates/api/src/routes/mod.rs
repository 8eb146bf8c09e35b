//! HTTP route handlers.

pub mod health;
pub mod metrics;
pub mod orders;
pub mod payments;
pub mod products;

use common::AggregateId;
use uuid::Uuid;

use crate::error::ApiError;

/// Parses an order id from a path segment or request body.
pub(crate) fn parse_order_id(raw: &str) -> Result<AggregateId, ApiError> {
    Uuid::parse_str(raw)
        .map(AggregateId::from_uuid)
        .map_err(|_| ApiError::BadRequest(format!("invalid order id: {raw}")))
}
