use common::{AggregateId, ProductId, ReservationId, UserId};
use serde::{Deserialize, Serialize};

/// One line of an order as collaborators see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price_minor: i64,
}

/// The order fields every order event carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    /// Order total in minor currency units.
    pub amount_minor: i64,
    pub currency: String,
}

/// A state transition announced to external collaborators.
///
/// Serialized with a dotted `event_type` tag, e.g. `"order.confirmed"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StorefrontEvent {
    #[serde(rename = "order.confirmed")]
    OrderConfirmed {
        #[serde(flatten)]
        order: OrderSummary,
        payment_ref: String,
    },

    #[serde(rename = "order.payment_failed")]
    OrderPaymentFailed {
        #[serde(flatten)]
        order: OrderSummary,
        reason: String,
        flagged_for_fraud: bool,
        /// Money was captured but the sale could not be completed.
        refund_required: bool,
    },

    #[serde(rename = "order.stock_rejected")]
    OrderStockRejected {
        #[serde(flatten)]
        order: OrderSummary,
        reason: String,
        product_id: Option<ProductId>,
        requested: Option<u32>,
        available: Option<u32>,
    },

    #[serde(rename = "order.cancelled")]
    OrderCancelled {
        #[serde(flatten)]
        order: OrderSummary,
        reason: String,
    },

    #[serde(rename = "order.refunded")]
    OrderRefunded {
        #[serde(flatten)]
        order: OrderSummary,
        reason: String,
    },

    /// Published by the sweeper; the checkout flow reacts to it.
    #[serde(rename = "reservation.expired")]
    ReservationExpired {
        reservation_id: ReservationId,
        order_id: AggregateId,
        product_id: ProductId,
        quantity: u32,
    },
}

impl StorefrontEvent {
    /// Dotted event name, identical to the serialized `event_type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            StorefrontEvent::OrderConfirmed { .. } => "order.confirmed",
            StorefrontEvent::OrderPaymentFailed { .. } => "order.payment_failed",
            StorefrontEvent::OrderStockRejected { .. } => "order.stock_rejected",
            StorefrontEvent::OrderCancelled { .. } => "order.cancelled",
            StorefrontEvent::OrderRefunded { .. } => "order.refunded",
            StorefrontEvent::ReservationExpired { .. } => "reservation.expired",
        }
    }

    pub fn order_id(&self) -> AggregateId {
        match self {
            StorefrontEvent::OrderConfirmed { order, .. }
            | StorefrontEvent::OrderPaymentFailed { order, .. }
            | StorefrontEvent::OrderStockRejected { order, .. }
            | StorefrontEvent::OrderCancelled { order, .. }
            | StorefrontEvent::OrderRefunded { order, .. } => order.order_id,
            StorefrontEvent::ReservationExpired { order_id, .. } => *order_id,
        }
    }
}
