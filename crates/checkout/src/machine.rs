//! Order state machine: drives an order through the stock ledger, the
//! payment gateway and the event publisher.
//!
//! ```text
//! CREATED ──reserve all──► STOCK_RESERVED ──intent──► PAYMENT_PENDING ──capture──► CONFIRMED ──► REFUNDED
//!    │                          │                        │
//!    ├─any item fails─► STOCK_REJECTED                   ├─decline / invalid / expiry──► PAYMENT_FAILED
//!    └─holds never recorded─► STOCK_REJECTED             │
//!                               └─gateway down──► PAYMENT_FAILED
//! ```
//!
//! Every transition for an order runs while holding the `order:<id>` lease,
//! so a webhook, a client verify call and the expiry listener never
//! interleave on the same order. The checkout's lease is sized to outlast
//! its slowest path. Each handler first looks at where the order already is,
//! which makes duplicate deliveries harmless.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{AggregateId, ReservationId, RetryPolicy};
use domain::{
    CancelOrder, ConfirmPayment, FailPayment, FailureReason, LineItem, Order, OrderHistory,
    OrderService, OrderStatus, PaymentFailure, PlaceOrder, RecordPaymentIntent,
    RecordStockReserved, RefundOrder, RejectStock, RejectionReason, StockRejection,
};
use event_store::EventStore;
use events::{EventPublisher, OrderItem, OrderSummary, StorefrontEvent};
use inventory::{
    LedgerError, Lease, LockService, ReservationState, StockLedger, acquire_with_retry,
};
use serde::Serialize;

use crate::cart::CartService;
use crate::error::{CheckoutError, GatewayError, Result};
use crate::gateway::PaymentGateway;

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Currency passed to the gateway when opening an intent.
    pub currency: String,
    /// Lifetime of an order lease outside checkout.
    pub lease_duration: Duration,
    pub lock_retry: RetryPolicy,
    /// How long checkout waits for the gateway to open an intent.
    pub gateway_timeout: Duration,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            currency: "INR".to_string(),
            lease_duration: Duration::from_millis(5000),
            lock_retry: RetryPolicy::default(),
            gateway_timeout: Duration::from_secs(10),
        }
    }
}

/// What the shopper gets back from checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedOrder {
    pub order_id: AggregateId,
    pub status: OrderStatus,
    pub payment_intent: Option<String>,
    /// Set when the order ended in STOCK_REJECTED.
    pub rejection: Option<StockRejection>,
}

pub struct OrderStateMachine<S: EventStore> {
    orders: OrderService<S>,
    ledger: Arc<StockLedger>,
    lock: Arc<dyn LockService>,
    gateway: Arc<dyn PaymentGateway>,
    cart: Arc<dyn CartService>,
    publisher: Arc<dyn EventPublisher>,
    config: CheckoutConfig,
}

impl<S: EventStore> OrderStateMachine<S> {
    pub fn new(
        orders: OrderService<S>,
        ledger: Arc<StockLedger>,
        lock: Arc<dyn LockService>,
        gateway: Arc<dyn PaymentGateway>,
        cart: Arc<dyn CartService>,
        publisher: Arc<dyn EventPublisher>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            orders,
            ledger,
            lock,
            gateway,
            cart,
            publisher,
            config,
        }
    }

    pub fn orders(&self) -> &OrderService<S> {
        &self.orders
    }

    pub fn ledger(&self) -> &Arc<StockLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Places the order, reserves every line item and opens a payment intent.
    ///
    /// A line item that cannot be reserved is not an error: the order ends
    /// in STOCK_REJECTED, every sibling reservation is released, and the
    /// rejection detail comes back in [`PlacedOrder::rejection`]. A gateway
    /// failure releases the stock, fails the order and is returned as
    /// [`CheckoutError::Gateway`].
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, user_id = %cmd.user_id))]
    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<PlacedOrder> {
        let started = Instant::now();
        let lease = self
            .lock_order_for(cmd.order_id, self.checkout_lease(cmd.items.len()))
            .await?;
        let result = self.checkout(&cmd).await;
        lease.release(self.lock.as_ref()).await;
        metrics::histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    /// A valid capture for the order. Confirms every reservation and the
    /// order, or fails the order with a refund owed when a reservation
    /// lapsed first. Repeated deliveries are no-ops.
    #[tracing::instrument(skip(self))]
    pub async fn on_payment_confirmed(
        &self,
        order_id: AggregateId,
        transaction_id: &str,
    ) -> Result<OrderStatus> {
        let lease = self.lock_order(order_id).await?;
        let result = self.confirm(order_id, transaction_id).await;
        lease.release(self.lock.as_ref()).await;
        result
    }

    /// A declined or unauthenticated payment. Releases the order's stock and
    /// moves it to PAYMENT_FAILED. Ignored once the order is confirmed.
    #[tracing::instrument(skip(self, failure), fields(reason = %failure.reason))]
    pub async fn on_payment_failed(
        &self,
        order_id: AggregateId,
        failure: PaymentFailure,
    ) -> Result<OrderStatus> {
        let lease = self.lock_order(order_id).await?;
        let result = self.decline(order_id, failure).await;
        lease.release(self.lock.as_ref()).await;
        result
    }

    /// The sweeper expired one of the order's reservations. An order still
    /// waiting for its payment can no longer be fulfilled and is failed; a
    /// checkout that never recorded its holds is rejected.
    ///
    /// Once handled, the expiry is acknowledged on the ledger so the sweeper
    /// stops announcing it. On error it stays unacknowledged and comes back.
    #[tracing::instrument(skip(self))]
    pub async fn on_reservation_expired(
        &self,
        order_id: AggregateId,
        reservation_id: ReservationId,
    ) -> Result<OrderStatus> {
        let lease = self.lock_order(order_id).await?;
        let result = self.expire(order_id, reservation_id).await;
        lease.release(self.lock.as_ref()).await;

        // No order means nothing left to reconcile.
        if matches!(result, Ok(_) | Err(CheckoutError::OrderNotFound(_)))
            && let Err(e) = self.ledger.acknowledge_expiry(reservation_id).await
        {
            tracing::warn!(%reservation_id, error = %e, "failed to acknowledge expiry");
        }
        result
    }

    /// Cancels an order that has not been confirmed.
    ///
    /// Orders that may still hold stock have their pending reservations
    /// released first. Cancelling twice is a no-op; a confirmed or refunded
    /// order cannot be cancelled.
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel_order(&self, order_id: AggregateId, reason: &str) -> Result<OrderStatus> {
        let lease = self.lock_order(order_id).await?;
        let result = self.cancel(order_id, reason).await;
        lease.release(self.lock.as_ref()).await;
        result
    }

    /// CONFIRMED → REFUNDED. The sale is final, so stock is not touched.
    #[tracing::instrument(skip(self, reason))]
    pub async fn refund_order(&self, order_id: AggregateId, reason: &str) -> Result<OrderStatus> {
        let lease = self.lock_order(order_id).await?;
        let result = self.refund(order_id, reason).await;
        lease.release(self.lock.as_ref()).await;
        result
    }

    pub async fn get_order(&self, order_id: AggregateId) -> Result<OrderHistory> {
        self.orders
            .history(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    pub async fn load(&self, order_id: AggregateId) -> Result<Order> {
        self.orders
            .get_order(order_id)
            .await?
            .ok_or(CheckoutError::OrderNotFound(order_id))
    }

    async fn lock_order(&self, order_id: AggregateId) -> Result<Lease> {
        self.lock_order_for(order_id, self.config.lease_duration).await
    }

    async fn lock_order_for(&self, order_id: AggregateId, duration: Duration) -> Result<Lease> {
        Ok(acquire_with_retry(
            self.lock.as_ref(),
            &order_key(order_id),
            duration,
            &self.config.lock_retry,
        )
        .await?)
    }

    /// Order lease for a checkout of `line_items` items: every product
    /// reservation may wait out its lease retries and hold the product lease
    /// in full, then the intent call may run to its timeout.
    pub fn checkout_lease(&self, line_items: usize) -> Duration {
        let ledger = self.ledger.config();
        let per_item = ledger.lock_retry.max_wait().saturating_add(ledger.lease_duration);
        let items = u32::try_from(line_items).unwrap_or(u32::MAX);
        self.config
            .lease_duration
            .saturating_add(per_item.saturating_mul(items))
            .saturating_add(self.config.gateway_timeout)
    }

    async fn checkout(&self, cmd: &PlaceOrder) -> Result<PlacedOrder> {
        let order_id = cmd.order_id;
        let order = self.orders.place_order(cmd).await?.aggregate;
        metrics::counter!("orders_placed_total").increment(1);

        // Sequential, so a failure leaves a known prefix to release.
        let mut reserved = Vec::with_capacity(order.items().len());
        for item in order.items() {
            match self
                .ledger
                .reserve(&item.product_id, item.quantity, order_id)
                .await
            {
                Ok(reservation) => reserved.push(reservation.reservation_id),
                Err(err) => return self.reject(order_id, item, err, &reserved).await,
            }
        }

        let recorded = self
            .orders
            .mark_stock_reserved(&RecordStockReserved {
                order_id,
                reservation_ids: reserved.clone(),
            })
            .await;
        let order = match recorded {
            Ok(result) => result.aggregate,
            Err(err) => {
                tracing::error!(error = %err, holding = reserved.len(), "failed to record reservations");
                self.interrupt(order_id, &reserved).await;
                return Err(err.into());
            }
        };

        let payment_ref = match self.create_intent(&order, order_id).await {
            Ok(payment_ref) => payment_ref,
            Err(err) => {
                tracing::warn!(error = %err, "payment intent failed, releasing stock");
                let failure = PaymentFailure::new(FailureReason::GatewayUnavailable)
                    .with_detail(err.to_string());
                self.fail(order_id, &order, failure).await?;
                return Err(err.into());
            }
        };

        let order = self
            .orders
            .record_payment_intent(&RecordPaymentIntent {
                order_id,
                payment_ref: payment_ref.clone(),
            })
            .await?
            .aggregate;

        Ok(PlacedOrder {
            order_id,
            status: order.status(),
            payment_intent: Some(payment_ref),
            rejection: None,
        })
    }

    async fn create_intent(
        &self,
        order: &Order,
        order_id: AggregateId,
    ) -> std::result::Result<String, GatewayError> {
        let timeout = self.config.gateway_timeout;
        let intent = self
            .gateway
            .create_intent(order.total_amount(), &self.config.currency, order_id);
        tokio::time::timeout(timeout, intent)
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::Unavailable(format!(
                    "no intent within {}ms",
                    timeout.as_millis()
                )))
            })
    }

    /// Checkout reserved stock but could not record it on the order. The
    /// order is rejected before the holds are released; if even that cannot
    /// be recorded the holds stay, and their expiry rejects the order later.
    async fn interrupt(&self, order_id: AggregateId, reserved: &[ReservationId]) {
        let rejection = StockRejection::new(RejectionReason::CheckoutInterrupted);
        match self.record_rejection(order_id, rejection, reserved).await {
            Ok(_) => self.release(reserved).await,
            Err(e) => {
                tracing::warn!(error = %e, "leaving reservations to expire");
            }
        }
    }

    async fn reject(
        &self,
        order_id: AggregateId,
        item: &LineItem,
        err: LedgerError,
        reserved: &[ReservationId],
    ) -> Result<PlacedOrder> {
        let rejection = match err {
            LedgerError::InsufficientStock {
                product_id,
                requested,
                available,
            } => StockRejection::insufficient(product_id, requested, available),
            LedgerError::ProductNotFound(product_id) => StockRejection::for_product(
                RejectionReason::ProductNotFound,
                product_id,
                item.quantity,
            ),
            LedgerError::LockUnavailable { .. } => StockRejection::for_product(
                RejectionReason::LockUnavailable,
                item.product_id.clone(),
                item.quantity,
            ),
            other => {
                tracing::error!(product_id = %item.product_id, error = %other, "ledger failed during reservation");
                StockRejection::for_product(
                    RejectionReason::LedgerUnavailable,
                    item.product_id.clone(),
                    item.quantity,
                )
            }
        };

        tracing::warn!(
            product_id = %item.product_id,
            reason = %rejection.reason,
            releasing = reserved.len(),
            "stock rejected"
        );
        self.release(reserved).await;
        let order = self
            .record_rejection(order_id, rejection.clone(), reserved)
            .await?;

        Ok(PlacedOrder {
            order_id,
            status: order.status(),
            payment_intent: None,
            rejection: Some(rejection),
        })
    }

    /// CREATED → STOCK_REJECTED, announced to collaborators.
    async fn record_rejection(
        &self,
        order_id: AggregateId,
        rejection: StockRejection,
        released: &[ReservationId],
    ) -> Result<Order> {
        let result = self
            .orders
            .reject_stock(&RejectStock {
                order_id,
                rejection: rejection.clone(),
                released: released.to_vec(),
            })
            .await?;
        if result.is_noop() {
            return Ok(result.aggregate);
        }

        let order = result.aggregate;
        metrics::counter!("orders_stock_rejected_total", "reason" => rejection.reason.as_str())
            .increment(1);
        self.publisher.publish(StorefrontEvent::OrderStockRejected {
            order: summary(order_id, &order),
            reason: rejection.reason.as_str().to_string(),
            product_id: rejection.product_id,
            requested: rejection.requested,
            available: rejection.available,
        });
        Ok(order)
    }

    async fn confirm(&self, order_id: AggregateId, transaction_id: &str) -> Result<OrderStatus> {
        let order = self.load(order_id).await?;
        match order.status() {
            OrderStatus::PaymentPending => {}
            OrderStatus::Confirmed => {
                tracing::debug!("duplicate payment confirmation");
                return Ok(OrderStatus::Confirmed);
            }
            OrderStatus::PaymentFailed => {
                // Captured after the order already failed: keep the failure,
                // record that the money has to go back.
                tracing::warn!(transaction_id, "payment captured on failed order, refund owed");
                let failure = order
                    .payment_failure()
                    .cloned()
                    .unwrap_or_else(|| PaymentFailure::new(FailureReason::ReservationExpired))
                    .with_refund_required();
                return self.fail(order_id, &order, failure).await;
            }
            status => {
                tracing::warn!(%status, transaction_id, "payment captured for order that cannot be confirmed");
                return Ok(status);
            }
        }

        match self.ledger.confirm_all(order.reservation_ids()).await {
            Ok(_) => {}
            Err(LedgerError::ReservationExpired { reservation_id }) => {
                tracing::warn!(%reservation_id, "reservation lapsed before capture, refund owed");
                let failure = PaymentFailure::new(FailureReason::ReservationExpired)
                    .with_detail(format!("reservation {reservation_id} expired before capture"))
                    .with_refund_required();
                return self.fail(order_id, &order, failure).await;
            }
            Err(err) => return Err(err.into()),
        }

        let confirmed = self
            .orders
            .confirm_payment(&ConfirmPayment {
                order_id,
                transaction_id: transaction_id.to_string(),
            })
            .await?
            .aggregate;

        if let Some(user_id) = confirmed.user_id() {
            if let Err(e) = self.cart.clear(user_id).await {
                tracing::warn!(%user_id, error = %e, "failed to clear cart");
            }
        }

        metrics::counter!("orders_confirmed_total").increment(1);
        self.publisher.publish(StorefrontEvent::OrderConfirmed {
            order: summary(order_id, &confirmed),
            payment_ref: confirmed.payment_ref().unwrap_or_default().to_string(),
        });
        Ok(confirmed.status())
    }

    async fn decline(&self, order_id: AggregateId, failure: PaymentFailure) -> Result<OrderStatus> {
        let order = self.load(order_id).await?;
        match order.status() {
            OrderStatus::PaymentPending | OrderStatus::StockReserved => {
                self.fail(order_id, &order, failure).await
            }
            OrderStatus::PaymentFailed => {
                tracing::debug!("payment already failed");
                Ok(OrderStatus::PaymentFailed)
            }
            status => {
                tracing::warn!(%status, "payment failure ignored, order already settled");
                Ok(status)
            }
        }
    }

    async fn expire(&self, order_id: AggregateId, reservation_id: ReservationId) -> Result<OrderStatus> {
        let order = self.load(order_id).await?;
        match order.status() {
            OrderStatus::PaymentPending | OrderStatus::StockReserved
                if order.reservation_ids().contains(&reservation_id) =>
            {
                tracing::warn!("reservation lapsed before payment resolved");
                let failure = PaymentFailure::new(FailureReason::ReservationExpired)
                    .with_detail(format!("reservation {reservation_id} expired"));
                self.fail(order_id, &order, failure).await
            }
            OrderStatus::Created => self.abandon(order_id, reservation_id).await,
            status => {
                tracing::debug!(%status, "expiry does not affect order");
                Ok(status)
            }
        }
    }

    /// A hold of a checkout that stopped before STOCK_RESERVED lapsed. The
    /// order never learnt its reservation ids, so the ledger is asked.
    async fn abandon(&self, order_id: AggregateId, reservation_id: ReservationId) -> Result<OrderStatus> {
        let held = self.ledger.reservations_for_order(order_id).await?;
        let Some(lapsed) = held.iter().find(|r| r.reservation_id == reservation_id) else {
            tracing::debug!("expiry does not affect order");
            return Ok(OrderStatus::Created);
        };

        tracing::warn!(product_id = %lapsed.product_id, "interrupted checkout lost its stock");
        let rejection = StockRejection::for_product(
            RejectionReason::CheckoutInterrupted,
            lapsed.product_id.clone(),
            lapsed.quantity,
        );
        let pending: Vec<ReservationId> = held
            .iter()
            .filter(|r| r.state == ReservationState::Pending)
            .map(|r| r.reservation_id)
            .collect();
        let order = self.record_rejection(order_id, rejection, &pending).await?;
        self.release(&pending).await;
        Ok(order.status())
    }

    async fn cancel(&self, order_id: AggregateId, reason: &str) -> Result<OrderStatus> {
        let order = self.load(order_id).await?;
        if order.status().holds_reservations() {
            // The ledger, not the order, is asked: a checkout interrupted
            // before STOCK_RESERVED has holds the order never recorded.
            let pending: Vec<ReservationId> = self
                .ledger
                .reservations_for_order(order_id)
                .await?
                .into_iter()
                .filter(|r| r.state == ReservationState::Pending)
                .map(|r| r.reservation_id)
                .collect();
            self.ledger.release_all(&pending).await?;
        }

        let result = self
            .orders
            .cancel_order(&CancelOrder::new(order_id, reason))
            .await?;
        if !result.is_noop() {
            self.publisher.publish(StorefrontEvent::OrderCancelled {
                order: summary(order_id, &result.aggregate),
                reason: reason.to_string(),
            });
        }
        Ok(result.aggregate.status())
    }

    async fn refund(&self, order_id: AggregateId, reason: &str) -> Result<OrderStatus> {
        self.load(order_id).await?;
        let result = self
            .orders
            .refund_order(&RefundOrder::new(order_id, reason))
            .await?;
        if !result.is_noop() {
            self.publisher.publish(StorefrontEvent::OrderRefunded {
                order: summary(order_id, &result.aggregate),
                reason: reason.to_string(),
            });
        }
        Ok(result.aggregate.status())
    }

    /// Releases the order's reservations and records the failure.
    async fn fail(
        &self,
        order_id: AggregateId,
        order: &Order,
        failure: PaymentFailure,
    ) -> Result<OrderStatus> {
        self.release(order.reservation_ids()).await;

        let reason = failure.reason;
        let result = self
            .orders
            .fail_payment(&FailPayment { order_id, failure })
            .await?;
        if result.is_noop() {
            return Ok(result.aggregate.status());
        }

        let failed = &result.aggregate;
        metrics::counter!("orders_payment_failed_total", "reason" => reason.as_str())
            .increment(1);
        self.publisher.publish(StorefrontEvent::OrderPaymentFailed {
            order: summary(order_id, failed),
            reason: failed.failure_reason().unwrap_or(reason.as_str()).to_string(),
            flagged_for_fraud: failed.flagged_for_fraud(),
            refund_required: failed.refund_required(),
        });
        Ok(failed.status())
    }

    /// Best-effort compensation. A reservation that cannot be released now
    /// stays PENDING until the sweeper expires it.
    async fn release(&self, reservation_ids: &[ReservationId]) {
        if reservation_ids.is_empty() {
            return;
        }
        if let Err(e) = self.ledger.release_all(reservation_ids).await {
            tracing::warn!(
                count = reservation_ids.len(),
                error = %e,
                "failed to release reservations, leaving them to the sweeper"
            );
        }
    }
}

fn order_key(order_id: AggregateId) -> String {
    format!("order:{order_id}")
}

fn summary(order_id: AggregateId, order: &Order) -> OrderSummary {
    OrderSummary {
        order_id,
        user_id: order.user_id().unwrap_or_default(),
        items: order
            .items()
            .iter()
            .map(|item| OrderItem {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
                unit_price_minor: item.unit_price.minor(),
            })
            .collect(),
        amount_minor: order.total_amount().minor(),
        currency: order.currency().to_string(),
    }
}
