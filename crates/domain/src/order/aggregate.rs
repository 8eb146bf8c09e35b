//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::{AggregateId, ProductId, ReservationId, UserId};
use event_store::Version;

use crate::aggregate::Aggregate;

use super::{
    events::{
        OrderCancelledData, OrderPlacedData, OrderRefundedData, PaymentConfirmedData,
        PaymentFailedData, PaymentIntentCreatedData, StockRejectedData, StockReservedData,
    },
    DeliveryAddress, LineItem, Money, OrderError, OrderEvent, OrderStatus, PaymentFailure,
    PaymentMethod, PlaceOrder, StockRejection,
};

/// Order aggregate root.
///
/// Command methods never mutate; they return the events that would move the
/// order forward. A command whose target status is already reached returns
/// no events, so redelivered triggers are harmless.
#[derive(Debug, Clone, Default)]
pub struct Order {
    id: Option<AggregateId>,
    version: Version,
    user_id: Option<UserId>,
    status: OrderStatus,
    items: Vec<LineItem>,
    total_amount: Money,
    currency: String,
    delivery_address: DeliveryAddress,
    payment_method: PaymentMethod,
    placed_at: Option<DateTime<Utc>>,
    reservation_ids: Vec<ReservationId>,
    rejection: Option<StockRejection>,
    payment_ref: Option<String>,
    transaction_id: Option<String>,
    failure: Option<PaymentFailure>,
    flagged_for_fraud: bool,
    refund_required: bool,
    closing_reason: Option<String>,
}

impl Aggregate for Order {
    type Event = OrderEvent;
    type Error = OrderError;

    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            OrderEvent::OrderPlaced(data) => self.apply_placed(data),
            OrderEvent::StockReserved(data) => {
                self.reservation_ids = data.reservation_ids;
                self.status = OrderStatus::StockReserved;
            }
            OrderEvent::StockRejected(data) => {
                self.rejection = Some(data.rejection);
                self.status = OrderStatus::StockRejected;
            }
            OrderEvent::PaymentIntentCreated(data) => {
                self.payment_ref = Some(data.payment_ref);
                self.status = OrderStatus::PaymentPending;
            }
            OrderEvent::PaymentConfirmed(data) => {
                self.transaction_id = Some(data.transaction_id);
                self.status = OrderStatus::Confirmed;
            }
            OrderEvent::PaymentFailed(data) => {
                self.flagged_for_fraud |= data.failure.flagged_for_fraud;
                self.refund_required |= data.failure.refund_required;
                self.failure = Some(data.failure);
                self.status = OrderStatus::PaymentFailed;
            }
            OrderEvent::OrderCancelled(data) => {
                self.closing_reason = Some(data.reason);
                self.status = OrderStatus::Cancelled;
            }
            OrderEvent::OrderRefunded(data) => {
                self.closing_reason = Some(data.reason);
                self.status = OrderStatus::Refunded;
            }
        }
    }
}

// Query methods
impl Order {
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    /// Merged quantity ordered for `product_id`.
    pub fn quantity_of(&self, product_id: &ProductId) -> Option<u32> {
        self.items
            .iter()
            .find(|item| &item.product_id == product_id)
            .map(|item| item.quantity)
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn delivery_address(&self) -> &DeliveryAddress {
        &self.delivery_address
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.placed_at
    }

    /// Reservations recorded when stock was reserved, in line-item order.
    pub fn reservation_ids(&self) -> &[ReservationId] {
        &self.reservation_ids
    }

    pub fn rejection(&self) -> Option<&StockRejection> {
        self.rejection.as_ref()
    }

    pub fn payment_ref(&self) -> Option<&str> {
        self.payment_ref.as_deref()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn payment_failure(&self) -> Option<&PaymentFailure> {
        self.failure.as_ref()
    }

    /// Reason code of the payment failure or stock rejection, if any.
    pub fn failure_reason(&self) -> Option<&'static str> {
        self.failure
            .as_ref()
            .map(|f| f.reason.as_str())
            .or_else(|| self.rejection.as_ref().map(|r| r.reason.as_str()))
    }

    pub fn flagged_for_fraud(&self) -> bool {
        self.flagged_for_fraud
    }

    pub fn refund_required(&self) -> bool {
        self.refund_required
    }

    /// Reason given when the order was cancelled or refunded.
    pub fn closing_reason(&self) -> Option<&str> {
        self.closing_reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_placed(&self) -> Result<(), OrderError> {
        match self.id {
            Some(_) => Ok(()),
            None => Err(OrderError::NotPlaced),
        }
    }

    fn invalid(&self, action: &'static str) -> OrderError {
        OrderError::InvalidStateTransition {
            current_state: self.status,
            action,
        }
    }
}

// Command methods (return events)
impl Order {
    /// Validates and normalizes the line items and opens the order.
    pub fn place(
        &self,
        cmd: &PlaceOrder,
        placed_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, OrderError> {
        if self.id.is_some() {
            return Err(OrderError::AlreadyPlaced);
        }

        let items = merge_line_items(&cmd.items)?;
        let total_amount = items.iter().try_fold(Money::zero(), |total, item| {
            item.subtotal()
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or(OrderError::AmountOverflow)
        })?;

        Ok(vec![OrderEvent::OrderPlaced(OrderPlacedData {
            order_id: cmd.order_id,
            user_id: cmd.user_id,
            items,
            total_amount,
            currency: cmd.currency.clone(),
            delivery_address: cmd.delivery_address.clone(),
            payment_method: cmd.payment_method,
            placed_at,
        })])
    }

    /// CREATED → STOCK_RESERVED once every line item holds a reservation.
    pub fn mark_stock_reserved(
        &self,
        reservation_ids: &[ReservationId],
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::StockReserved => Ok(vec![]),
            OrderStatus::Created => {
                if reservation_ids.len() != self.items.len() {
                    return Err(OrderError::ReservationMismatch {
                        expected: self.items.len(),
                        actual: reservation_ids.len(),
                    });
                }
                Ok(vec![OrderEvent::StockReserved(StockReservedData {
                    reservation_ids: reservation_ids.to_vec(),
                })])
            }
            _ => Err(self.invalid("mark stock reserved")),
        }
    }

    /// CREATED → STOCK_REJECTED after sibling reservations were released.
    pub fn reject_stock(
        &self,
        rejection: &StockRejection,
        released: &[ReservationId],
    ) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::StockRejected => Ok(vec![]),
            OrderStatus::Created => Ok(vec![OrderEvent::StockRejected(StockRejectedData {
                rejection: rejection.clone(),
                released: released.to_vec(),
            })]),
            _ => Err(self.invalid("reject stock")),
        }
    }

    /// STOCK_RESERVED → PAYMENT_PENDING.
    pub fn record_payment_intent(&self, payment_ref: &str) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match (self.status, self.payment_ref.as_deref()) {
            (OrderStatus::PaymentPending, Some(current)) if current == payment_ref => Ok(vec![]),
            (OrderStatus::PaymentPending, Some(current)) => Err(OrderError::PaymentRefMismatch {
                expected: current.to_string(),
                actual: payment_ref.to_string(),
            }),
            (OrderStatus::StockReserved, _) => Ok(vec![OrderEvent::PaymentIntentCreated(
                PaymentIntentCreatedData {
                    payment_ref: payment_ref.to_string(),
                },
            )]),
            _ => Err(self.invalid("record payment intent")),
        }
    }

    /// PAYMENT_PENDING → CONFIRMED. Confirming twice is a no-op.
    pub fn confirm_payment(&self, transaction_id: &str) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::Confirmed => Ok(vec![]),
            OrderStatus::PaymentPending => {
                Ok(vec![OrderEvent::PaymentConfirmed(PaymentConfirmedData {
                    payment_ref: self.payment_ref.clone().unwrap_or_default(),
                    transaction_id: transaction_id.to_string(),
                })])
            }
            _ => Err(self.invalid("confirm payment")),
        }
    }

    /// PAYMENT_PENDING (or STOCK_RESERVED when no intent could be created)
    /// → PAYMENT_FAILED.
    ///
    /// A confirmed order is not moved: confirmation is sticky and only a
    /// refund leaves it. On an already failed order the only thing still
    /// recorded is a newly owed refund (money captured after the failure).
    pub fn fail_payment(&self, failure: &PaymentFailure) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::PaymentFailed if failure.refund_required && !self.refund_required => {
                Ok(vec![OrderEvent::PaymentFailed(PaymentFailedData {
                    failure: failure.clone(),
                })])
            }
            OrderStatus::PaymentFailed => Ok(vec![]),
            OrderStatus::PaymentPending | OrderStatus::StockReserved => {
                Ok(vec![OrderEvent::PaymentFailed(PaymentFailedData {
                    failure: failure.clone(),
                })])
            }
            _ => Err(self.invalid("fail payment")),
        }
    }

    pub fn cancel(&self, reason: &str) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        if self.status == OrderStatus::Cancelled {
            return Ok(vec![]);
        }
        if !self.status.can_cancel() {
            return Err(self.invalid("cancel"));
        }
        Ok(vec![OrderEvent::OrderCancelled(OrderCancelledData {
            reason: reason.to_string(),
        })])
    }

    /// CONFIRMED → REFUNDED.
    pub fn refund(&self, reason: &str) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::Refunded => Ok(vec![]),
            OrderStatus::Confirmed => Ok(vec![OrderEvent::OrderRefunded(OrderRefundedData {
                reason: reason.to_string(),
            })]),
            _ => Err(self.invalid("refund")),
        }
    }
}

impl Order {
    fn apply_placed(&mut self, data: OrderPlacedData) {
        self.id = Some(data.order_id);
        self.user_id = Some(data.user_id);
        self.items = data.items;
        self.total_amount = data.total_amount;
        self.currency = data.currency;
        self.delivery_address = data.delivery_address;
        self.payment_method = data.payment_method;
        self.placed_at = Some(data.placed_at);
        self.status = OrderStatus::Created;
    }
}

/// Rejects empty carts, zero quantities and non-positive prices, and folds
/// repeated products into one line, keeping first-seen order.
fn merge_line_items(items: &[LineItem]) -> Result<Vec<LineItem>, OrderError> {
    if items.is_empty() {
        return Err(OrderError::NoItems);
    }

    let mut merged: Vec<LineItem> = Vec::with_capacity(items.len());
    for item in items {
        if item.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            });
        }
        if !item.unit_price.is_positive() {
            return Err(OrderError::InvalidPrice {
                product_id: item.product_id.clone(),
                price: item.unit_price.minor(),
            });
        }

        match merged.iter_mut().find(|m| m.product_id == item.product_id) {
            Some(existing) if existing.unit_price != item.unit_price => {
                return Err(OrderError::ConflictingPrices {
                    product_id: item.product_id.clone(),
                });
            }
            Some(existing) => {
                existing.quantity =
                    existing
                        .quantity
                        .checked_add(item.quantity)
                        .ok_or_else(|| OrderError::InvalidQuantity {
                            product_id: item.product_id.clone(),
                            quantity: item.quantity,
                        })?;
            }
            None => merged.push(item.clone()),
        }
    }

    Ok(merged)
}
