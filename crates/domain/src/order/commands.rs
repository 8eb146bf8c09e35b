//! Order commands.

use common::{AggregateId, ReservationId, UserId};

use crate::command::Command;

use super::{DeliveryAddress, LineItem, Order, PaymentFailure, PaymentMethod, StockRejection};

/// Opens a new order in CREATED.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub items: Vec<LineItem>,
    pub currency: String,
    pub delivery_address: DeliveryAddress,
    pub payment_method: PaymentMethod,
}

impl PlaceOrder {
    /// A command for a fresh order id.
    pub fn new(
        user_id: UserId,
        items: Vec<LineItem>,
        currency: impl Into<String>,
        delivery_address: DeliveryAddress,
        payment_method: PaymentMethod,
    ) -> Self {
        Self {
            order_id: AggregateId::new(),
            user_id,
            items,
            currency: currency.into(),
            delivery_address,
            payment_method,
        }
    }
}

/// Every line item holds a reservation.
#[derive(Debug, Clone)]
pub struct RecordStockReserved {
    pub order_id: AggregateId,
    pub reservation_ids: Vec<ReservationId>,
}

#[derive(Debug, Clone)]
pub struct RejectStock {
    pub order_id: AggregateId,
    pub rejection: StockRejection,
    pub released: Vec<ReservationId>,
}

#[derive(Debug, Clone)]
pub struct RecordPaymentIntent {
    pub order_id: AggregateId,
    pub payment_ref: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmPayment {
    pub order_id: AggregateId,
    pub transaction_id: String,
}

#[derive(Debug, Clone)]
pub struct FailPayment {
    pub order_id: AggregateId,
    pub failure: PaymentFailure,
}

#[derive(Debug, Clone)]
pub struct CancelOrder {
    pub order_id: AggregateId,
    pub reason: String,
}

impl CancelOrder {
    pub fn new(order_id: AggregateId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundOrder {
    pub order_id: AggregateId,
    pub reason: String,
}

impl RefundOrder {
    pub fn new(order_id: AggregateId, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            reason: reason.into(),
        }
    }
}

macro_rules! order_command {
    ($($command:ty),+ $(,)?) => {
        $(
            impl Command for $command {
                type Aggregate = Order;

                fn aggregate_id(&self) -> AggregateId {
                    self.order_id
                }
            }
        )+
    };
}

order_command!(
    PlaceOrder,
    RecordStockReserved,
    RejectStock,
    RecordPaymentIntent,
    ConfirmPayment,
    FailPayment,
    CancelOrder,
    RefundOrder,
);
