//! Order aggregate and related types.

mod aggregate;
mod commands;
mod events;
mod service;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use commands::*;
pub use events::{
    FailureReason, OrderCancelledData, OrderEvent, OrderPlacedData, OrderRefundedData,
    PaymentConfirmedData, PaymentFailedData, PaymentFailure, PaymentIntentCreatedData,
    RejectionReason, StockRejectedData, StockRejection, StockReservedData,
};
pub use service::{OrderHistory, OrderService, TimelineEntry};
pub use state::OrderStatus;
pub use value_objects::{DeliveryAddress, LineItem, Money, PaymentMethod};

use common::ProductId;
use thiserror::Error;

/// Reasons the order refuses a command.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order already placed")]
    AlreadyPlaced,

    #[error("Order has not been placed")]
    NotPlaced,

    #[error("Invalid state transition: cannot {action} from {current_state} state")]
    InvalidStateTransition {
        current_state: OrderStatus,
        action: &'static str,
    },

    #[error("Order has no items")]
    NoItems,

    #[error("Invalid quantity for {product_id}: {quantity} (must be greater than 0)")]
    InvalidQuantity { product_id: ProductId, quantity: u32 },

    #[error("Invalid price for {product_id}: {price} (must be greater than 0)")]
    InvalidPrice { product_id: ProductId, price: i64 },

    /// The same product appears twice with different unit prices.
    #[error("Conflicting unit prices for {product_id}")]
    ConflictingPrices { product_id: ProductId },

    #[error("Order total overflows")]
    AmountOverflow,

    #[error("Expected one reservation per line item ({expected}), got {actual}")]
    ReservationMismatch { expected: usize, actual: usize },

    #[error("Order is waiting on payment {expected}, not {actual}")]
    PaymentRefMismatch { expected: String, actual: String },
}
