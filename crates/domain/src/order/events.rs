//! Order domain events.

use std::fmt;

use chrono::{DateTime, Utc};
use common::{AggregateId, ProductId, ReservationId, UserId};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;

use super::{DeliveryAddress, LineItem, Money, PaymentMethod};

/// Everything that can happen to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    OrderPlaced(OrderPlacedData),
    StockReserved(StockReservedData),
    StockRejected(StockRejectedData),
    PaymentIntentCreated(PaymentIntentCreatedData),
    PaymentConfirmed(PaymentConfirmedData),
    PaymentFailed(PaymentFailedData),
    OrderCancelled(OrderCancelledData),
    OrderRefunded(OrderRefundedData),
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderPlaced(_) => "OrderPlaced",
            OrderEvent::StockReserved(_) => "StockReserved",
            OrderEvent::StockRejected(_) => "StockRejected",
            OrderEvent::PaymentIntentCreated(_) => "PaymentIntentCreated",
            OrderEvent::PaymentConfirmed(_) => "PaymentConfirmed",
            OrderEvent::PaymentFailed(_) => "PaymentFailed",
            OrderEvent::OrderCancelled(_) => "OrderCancelled",
            OrderEvent::OrderRefunded(_) => "OrderRefunded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedData {
    pub order_id: AggregateId,
    pub user_id: UserId,
    /// Line items after merging duplicate products.
    pub items: Vec<LineItem>,
    pub total_amount: Money,
    pub currency: String,
    pub delivery_address: DeliveryAddress,
    pub payment_method: PaymentMethod,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservedData {
    /// One reservation per line item, in line-item order.
    pub reservation_ids: Vec<ReservationId>,
}

/// Why an order could not get all of its stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InsufficientStock,
    ProductNotFound,
    /// The product lease could not be acquired within the retry bound.
    LockUnavailable,
    /// The stock store failed or kept losing version races.
    LedgerUnavailable,
    /// Stock was reserved but the checkout stopped before recording it.
    CheckoutInterrupted,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InsufficientStock => "insufficient_stock",
            RejectionReason::ProductNotFound => "product_not_found",
            RejectionReason::LockUnavailable => "lock_unavailable",
            RejectionReason::LedgerUnavailable => "ledger_unavailable",
            RejectionReason::CheckoutInterrupted => "checkout_interrupted",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The line item that failed to reserve, with enough detail to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRejection {
    pub reason: RejectionReason,
    pub product_id: Option<ProductId>,
    pub requested: Option<u32>,
    pub available: Option<u32>,
}

impl StockRejection {
    /// A rejection that is not about one particular line item.
    pub fn new(reason: RejectionReason) -> Self {
        Self {
            reason,
            product_id: None,
            requested: None,
            available: None,
        }
    }

    pub fn insufficient(product_id: ProductId, requested: u32, available: u32) -> Self {
        Self {
            reason: RejectionReason::InsufficientStock,
            product_id: Some(product_id),
            requested: Some(requested),
            available: Some(available),
        }
    }

    pub fn for_product(reason: RejectionReason, product_id: ProductId, requested: u32) -> Self {
        Self {
            reason,
            product_id: Some(product_id),
            requested: Some(requested),
            available: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRejectedData {
    pub rejection: StockRejection,
    /// Sibling reservations released before the rejection was recorded.
    pub released: Vec<ReservationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentCreatedData {
    pub payment_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmedData {
    pub payment_ref: String,
    pub transaction_id: String,
}

/// Why a payment did not complete the sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The gateway declined the payment.
    Declined,
    /// The gateway evidence failed authentication.
    InvalidSignature,
    /// A reservation lapsed before the payment was resolved.
    ReservationExpired,
    /// No payment intent could be created.
    GatewayUnavailable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Declined => "declined",
            FailureReason::InvalidSignature => "invalid_signature",
            FailureReason::ReservationExpired => "reservation_expired",
            FailureReason::GatewayUnavailable => "gateway_unavailable",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payment failed and what the order owes the shopper because of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub reason: FailureReason,
    /// Gateway decline code or other free-form context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub flagged_for_fraud: bool,
    /// Money was captured but the sale cannot be honoured.
    pub refund_required: bool,
}

impl PaymentFailure {
    pub fn new(reason: FailureReason) -> Self {
        Self {
            reason,
            detail: None,
            flagged_for_fraud: reason == FailureReason::InvalidSignature,
            refund_required: false,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_refund_required(mut self) -> Self {
        self.refund_required = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub failure: PaymentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRefundedData {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_payload_is_tagged() {
        let event = OrderEvent::PaymentFailed(PaymentFailedData {
            failure: PaymentFailure::new(FailureReason::InvalidSignature),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PaymentFailed");
        assert_eq!(json["data"]["failure"]["reason"], "invalid_signature");
        assert_eq!(json["data"]["failure"]["flagged_for_fraud"], true);

        let back: OrderEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn only_signature_failures_are_flagged() {
        assert!(PaymentFailure::new(FailureReason::InvalidSignature).flagged_for_fraud);
        assert!(!PaymentFailure::new(FailureReason::Declined).flagged_for_fraud);
        assert!(!PaymentFailure::new(FailureReason::ReservationExpired).flagged_for_fraud);
    }

    #[test]
    fn reason_codes() {
        assert_eq!(RejectionReason::LockUnavailable.as_str(), "lock_unavailable");
        assert_eq!(FailureReason::GatewayUnavailable.to_string(), "gateway_unavailable");
    }
}
