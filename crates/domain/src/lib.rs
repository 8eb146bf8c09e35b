//! Event-sourced order domain.
//!
//! - [`Aggregate`] / [`DomainEvent`]: the event-sourcing contracts.
//! - [`CommandHandler`]: load, decide, append, with reload-and-retry on
//!   journal conflicts.
//! - [`Order`]: the order lifecycle from CREATED to CONFIRMED, CANCELLED or
//!   REFUNDED, driven through [`OrderService`].

pub mod aggregate;
pub mod command;
pub mod error;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::{DomainError, Result};
pub use order::{
    CancelOrder, ConfirmPayment, DeliveryAddress, FailPayment, FailureReason, LineItem, Money,
    Order, OrderError, OrderEvent, OrderHistory, OrderService, OrderStatus, PaymentFailure,
    PaymentMethod, PlaceOrder, RecordPaymentIntent, RecordStockReserved, RefundOrder, RejectStock,
    RejectionReason, StockRejection, TimelineEntry,
};
