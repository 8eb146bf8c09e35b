//! Order service: the command API the checkout flow drives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{AggregateId, Clock, RetryPolicy, SystemClock};
use event_store::EventStore;
use serde::Serialize;

use crate::aggregate::Aggregate;
use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{
    CancelOrder, ConfirmPayment, FailPayment, Order, OrderStatus, PlaceOrder, RecordPaymentIntent,
    RecordStockReserved, RefundOrder, RejectStock,
};

/// One journal entry as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub event_type: String,
    /// Status right after the event was applied.
    pub status: OrderStatus,
    pub at: DateTime<Utc>,
}

/// An order together with every transition it went through.
#[derive(Debug, Clone)]
pub struct OrderHistory {
    pub order: Order,
    pub timeline: Vec<TimelineEntry>,
}

/// Wraps the order command handler. Every command is retried after a reload
/// when another writer appended to the same order first.
pub struct OrderService<S: EventStore> {
    handler: CommandHandler<S, Order>,
    clock: Arc<dyn Clock>,
    conflict_retry: RetryPolicy,
}

impl<S: EventStore> OrderService<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            handler: CommandHandler::with_clock(store, clock.clone()),
            clock,
            conflict_retry: RetryPolicy::new(5, Duration::from_millis(5)),
        }
    }

    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, user_id = %cmd.user_id))]
    pub async fn place_order(&self, cmd: &PlaceOrder) -> Result<CommandResult<Order>, DomainError> {
        let placed_at = self.clock.now();
        let result = self
            .handler
            .execute_with_retry(cmd.order_id, &self.conflict_retry, |order| {
                order.place(cmd, placed_at)
            })
            .await?;
        log_transition(&result);
        Ok(result)
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn mark_stock_reserved(
        &self,
        cmd: &RecordStockReserved,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(cmd.order_id, |order| {
            order.mark_stock_reserved(&cmd.reservation_ids)
        })
        .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, reason = %cmd.rejection.reason))]
    pub async fn reject_stock(&self, cmd: &RejectStock) -> Result<CommandResult<Order>, DomainError> {
        self.run(cmd.order_id, |order| {
            order.reject_stock(&cmd.rejection, &cmd.released)
        })
        .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, payment_ref = %cmd.payment_ref))]
    pub async fn record_payment_intent(
        &self,
        cmd: &RecordPaymentIntent,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(cmd.order_id, |order| {
            order.record_payment_intent(&cmd.payment_ref)
        })
        .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn confirm_payment(
        &self,
        cmd: &ConfirmPayment,
    ) -> Result<CommandResult<Order>, DomainError> {
        self.run(cmd.order_id, |order| order.confirm_payment(&cmd.transaction_id))
            .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, reason = %cmd.failure.reason))]
    pub async fn fail_payment(&self, cmd: &FailPayment) -> Result<CommandResult<Order>, DomainError> {
        self.run(cmd.order_id, |order| order.fail_payment(&cmd.failure))
            .await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn cancel_order(&self, cmd: &CancelOrder) -> Result<CommandResult<Order>, DomainError> {
        self.run(cmd.order_id, |order| order.cancel(&cmd.reason)).await
    }

    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn refund_order(&self, cmd: &RefundOrder) -> Result<CommandResult<Order>, DomainError> {
        self.run(cmd.order_id, |order| order.refund(&cmd.reason)).await
    }

    /// Returns None if the order doesn't exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>, DomainError> {
        self.handler.load_existing(order_id).await
    }

    /// The order plus one timeline entry per journal event.
    #[tracing::instrument(skip(self))]
    pub async fn history(&self, order_id: AggregateId) -> Result<Option<OrderHistory>, DomainError> {
        let mut timeline = Vec::new();
        let order = self
            .handler
            .replay(order_id, |envelope, order| {
                timeline.push(TimelineEntry {
                    event_type: envelope.event_type.clone(),
                    status: order.status(),
                    at: envelope.timestamp,
                });
            })
            .await?;

        Ok(order
            .id()
            .is_some()
            .then_some(OrderHistory { order, timeline }))
    }

    async fn run<F>(&self, order_id: AggregateId, command_fn: F) -> Result<CommandResult<Order>, DomainError>
    where
        F: Fn(&Order) -> Result<Vec<super::OrderEvent>, super::OrderError> + Sync,
    {
        let result = self
            .handler
            .execute_with_retry(order_id, &self.conflict_retry, command_fn)
            .await?;
        log_transition(&result);
        Ok(result)
    }
}

fn log_transition(result: &CommandResult<Order>) {
    if result.is_noop() {
        tracing::debug!(status = %result.aggregate.status(), "order already in target state");
    } else {
        tracing::info!(
            status = %result.aggregate.status(),
            version = result.new_version.as_i64(),
            "order transitioned"
        );
    }
}
