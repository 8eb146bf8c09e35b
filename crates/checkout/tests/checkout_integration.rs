//! End-to-end checkout: order state machine, stock ledger, payment
//! coordinator and expiry listener wired over in-memory stores.
//!
//! Time is a `ManualClock`; reservation expiry is reached by advancing it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use checkout::{
    CheckoutConfig, CheckoutError, EvidenceSigner, ExpiryListener, GatewayError,
    InMemoryCartService, InMemoryPaymentGateway, OrderStateMachine, PaymentCoordinator,
    PaymentGateway, PaymentOutcome, Verdict,
};
use common::{AggregateId, ManualClock, ProductId, ReservationId, RetryPolicy, UserId};
use domain::{
    DeliveryAddress, DomainError, LineItem, Money, OrderError, OrderService, OrderStatus,
    PaymentMethod, PlaceOrder, RejectionReason,
};
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, InMemoryEventStore, Version,
};
use events::{EventBus, StorefrontEvent};
use inventory::{
    InMemoryLockService, InMemoryStockStore, LedgerConfig, LockService, MovementKind,
    ReservationState, ReservationSweeper, StockLedger, SweeperConfig,
};
use tokio::sync::{Notify, broadcast};

const SECRET: &str = "whsec_test";
const WINDOW: Duration = Duration::from_secs(600);

struct Harness {
    machine: Arc<OrderStateMachine<InMemoryEventStore>>,
    coordinator: PaymentCoordinator<InMemoryEventStore>,
    ledger: Arc<StockLedger>,
    lock: Arc<InMemoryLockService>,
    store: InMemoryEventStore,
    gateway: InMemoryPaymentGateway,
    cart: InMemoryCartService,
    bus: Arc<EventBus>,
    clock: ManualClock,
}

fn harness() -> Harness {
    harness_with_stock_retry(RetryPolicy::new(200, Duration::from_millis(1)))
}

fn harness_with_stock_retry(lock_retry: RetryPolicy) -> Harness {
    let clock = ManualClock::default();
    let lock = Arc::new(InMemoryLockService::new(Arc::new(clock.clone())));
    let ledger = Arc::new(StockLedger::new(
        lock.clone(),
        Arc::new(InMemoryStockStore::new()),
        Arc::new(clock.clone()),
        LedgerConfig {
            reservation_window: WINDOW,
            lease_duration: Duration::from_secs(5),
            lock_retry,
        },
    ));
    let store = InMemoryEventStore::new();
    let gateway = InMemoryPaymentGateway::new(SECRET);
    let cart = InMemoryCartService::new();
    let bus = Arc::new(EventBus::default());

    let machine = Arc::new(OrderStateMachine::new(
        OrderService::with_clock(store.clone(), Arc::new(clock.clone())),
        ledger.clone(),
        lock.clone(),
        Arc::new(gateway.clone()),
        Arc::new(cart.clone()),
        bus.clone(),
        CheckoutConfig {
            lock_retry: RetryPolicy::new(200, Duration::from_millis(1)),
            ..CheckoutConfig::default()
        },
    ));
    let coordinator = PaymentCoordinator::new(machine.clone(), EvidenceSigner::new(SECRET));

    Harness {
        machine,
        coordinator,
        ledger,
        lock,
        store,
        gateway,
        cart,
        bus,
        clock,
    }
}

/// A second state machine over the harness ledger, lease table and bus, with
/// its own journal and gateway.
fn machine_over<S: EventStore>(
    h: &Harness,
    store: S,
    gateway: Arc<dyn PaymentGateway>,
) -> Arc<OrderStateMachine<S>> {
    Arc::new(OrderStateMachine::new(
        OrderService::with_clock(store, Arc::new(h.clock.clone())),
        h.ledger.clone(),
        h.lock.clone(),
        gateway,
        Arc::new(h.cart.clone()),
        h.bus.clone(),
        h.machine.config().clone(),
    ))
}

/// Journal that refuses appends of the listed event types.
#[derive(Clone, Default)]
struct FlakyJournal {
    inner: InMemoryEventStore,
    refused: Arc<Mutex<Vec<&'static str>>>,
}

impl FlakyJournal {
    fn refuse(&self, event_types: &[&'static str]) {
        *self.refused.lock().unwrap() = event_types.to_vec();
    }
}

#[async_trait]
impl EventStore for FlakyJournal {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> event_store::Result<Version> {
        let refused = events.first().is_some_and(|e| {
            self.refused.lock().unwrap().iter().any(|t| *t == e.event_type)
        });
        if refused {
            return Err(EventStoreError::InvalidAppend("journal offline".into()));
        }
        self.inner.append(events, options).await
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> event_store::Result<Vec<EventEnvelope>> {
        self.inner.get_events_for_aggregate(aggregate_id).await
    }
}

/// Gateway that moves the clock past the plain order lease, then answers
/// only when told to.
struct SlowGateway {
    inner: InMemoryPaymentGateway,
    clock: ManualClock,
    entered: Notify,
    proceed: Notify,
}

#[async_trait]
impl PaymentGateway for SlowGateway {
    async fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        order_id: AggregateId,
    ) -> Result<String, GatewayError> {
        self.clock.advance(Duration::from_secs(6));
        self.entered.notify_one();
        self.proceed.notified().await;
        self.inner.create_intent(amount, currency, order_id).await
    }
}

fn drain_expiries(rx: &mut broadcast::Receiver<StorefrontEvent>) -> Vec<StorefrontEvent> {
    let mut expiries = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if matches!(event, StorefrontEvent::ReservationExpired { .. }) {
            expiries.push(event);
        }
    }
    expiries
}

fn milk() -> ProductId {
    ProductId::new("milk-1l")
}

fn atta() -> ProductId {
    ProductId::new("atta-5kg")
}

fn order_for(user_id: UserId, items: Vec<LineItem>) -> PlaceOrder {
    PlaceOrder::new(
        user_id,
        items,
        "INR",
        DeliveryAddress {
            line1: "221 Residency Road".into(),
            line2: None,
            city: "Bengaluru".into(),
            postal_code: "560025".into(),
        },
        PaymentMethod::Upi,
    )
}

fn basket() -> PlaceOrder {
    order_for(
        UserId::new(),
        vec![
            LineItem::new("milk-1l", 2, Money::from_minor(6_000)),
            LineItem::new("atta-5kg", 1, Money::from_minor(27_500)),
        ],
    )
}

impl Harness {
    async fn stocked(self) -> Self {
        self.ledger.restock(&milk(), 5).await.unwrap();
        self.ledger.restock(&atta(), 3).await.unwrap();
        self
    }

    /// Places the basket and expects it to reach PAYMENT_PENDING.
    async fn pending_order(&self) -> (AggregateId, UserId) {
        let cmd = basket();
        let user_id = cmd.user_id;
        let placed = self.machine.place_order(cmd).await.unwrap();
        assert_eq!(placed.status, OrderStatus::PaymentPending);
        (placed.order_id, user_id)
    }

    async fn pay(&self, order_id: AggregateId, outcome: PaymentOutcome) -> checkout::PaymentVerification {
        let evidence = self.gateway.settle(order_id, outcome).unwrap().unwrap();
        self.coordinator.verify(order_id, &evidence).await.unwrap()
    }

    async fn reserved(&self, product_id: &ProductId) -> u32 {
        self.ledger.stock(product_id).await.unwrap().reserved_quantity
    }

    async fn available(&self, product_id: &ProductId) -> u32 {
        self.ledger.stock(product_id).await.unwrap().available_quantity
    }
}

mod checkout_flow {
    use super::*;

    #[tokio::test]
    async fn checkout_reserves_every_item_and_opens_intent() {
        let h = harness().stocked().await;

        let placed = h.machine.place_order(basket()).await.unwrap();

        assert_eq!(placed.status, OrderStatus::PaymentPending);
        assert_eq!(placed.payment_intent.as_deref(), Some("pi_0001"));
        assert!(placed.rejection.is_none());
        assert_eq!(h.reserved(&milk()).await, 2);
        assert_eq!(h.reserved(&atta()).await, 1);

        let intent = h.gateway.intent_for(placed.order_id).unwrap();
        assert_eq!(intent.amount, Money::from_minor(39_500));
        assert_eq!(intent.currency, "INR");

        let order = h.machine.load(placed.order_id).await.unwrap();
        assert_eq!(order.reservation_ids().len(), 2);
        assert_eq!(order.payment_ref(), Some("pi_0001"));
    }

    #[tokio::test]
    async fn capture_sells_stock_clears_cart_and_announces() {
        let h = harness().stocked().await;
        let mut rx = h.bus.subscribe();
        let (order_id, user_id) = h.pending_order().await;

        let verification = h.pay(order_id, PaymentOutcome::Captured).await;

        assert_eq!(verification.verdict, Verdict::Confirmed);
        assert_eq!(verification.status, OrderStatus::Confirmed);
        assert_eq!(h.available(&milk()).await, 3);
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.available(&atta()).await, 2);
        assert_eq!(h.cart.cleared(), vec![user_id]);

        match rx.recv().await.unwrap() {
            StorefrontEvent::OrderConfirmed { order, payment_ref } => {
                assert_eq!(order.order_id, order_id);
                assert_eq!(order.user_id, user_id);
                assert_eq!(order.amount_minor, 39_500);
                assert_eq!(order.items.len(), 2);
                assert_eq!(payment_ref, "pi_0001");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_capture_sells_stock_once() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        let evidence = h
            .gateway
            .settle(order_id, PaymentOutcome::Captured)
            .unwrap()
            .unwrap();

        let first = h.coordinator.verify(order_id, &evidence).await.unwrap();
        let second = h.coordinator.verify(order_id, &evidence).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.status, OrderStatus::Confirmed);
        assert_eq!(h.available(&milk()).await, 3);
        assert_eq!(h.store.event_count().await, 4);

        let confirms = h
            .ledger
            .movements(&milk())
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MovementKind::Confirm)
            .count();
        assert_eq!(confirms, 1);
    }

    #[tokio::test]
    async fn client_verify_and_webhook_racing_confirm_once() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        let evidence = h
            .gateway
            .settle(order_id, PaymentOutcome::Captured)
            .unwrap()
            .unwrap();
        let coordinator = Arc::new(h.coordinator);

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let coordinator = coordinator.clone();
                let evidence = evidence.clone();
                tokio::spawn(async move { coordinator.verify(order_id, &evidence).await })
            })
            .collect();
        for task in tasks {
            let verification = task.await.unwrap().unwrap();
            assert_eq!(verification.status, OrderStatus::Confirmed);
        }

        assert_eq!(h.ledger.stock(&milk()).await.unwrap().available_quantity, 3);
        assert_eq!(h.store.event_count().await, 4);
    }

    #[tokio::test]
    async fn decline_after_confirmation_is_ignored() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.pay(order_id, PaymentOutcome::Captured).await;

        let late = h
            .pay(
                order_id,
                PaymentOutcome::Declined {
                    reason: "card_declined".into(),
                },
            )
            .await;

        assert_eq!(late.verdict, Verdict::Declined);
        assert_eq!(late.status, OrderStatus::Confirmed);
        assert_eq!(h.available(&milk()).await, 3);
    }

    #[tokio::test]
    async fn refund_leaves_sold_stock_alone() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.pay(order_id, PaymentOutcome::Captured).await;

        let status = h.machine.refund_order(order_id, "items damaged").await.unwrap();
        let again = h.machine.refund_order(order_id, "items damaged").await.unwrap();

        assert_eq!(status, OrderStatus::Refunded);
        assert_eq!(again, OrderStatus::Refunded);
        assert_eq!(h.available(&milk()).await, 3);
        assert_eq!(h.reserved(&milk()).await, 0);
    }

    #[tokio::test]
    async fn timeline_follows_the_order() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.pay(order_id, PaymentOutcome::Captured).await;

        let history = h.machine.get_order(order_id).await.unwrap();
        let statuses: Vec<_> = history.timeline.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                OrderStatus::Created,
                OrderStatus::StockReserved,
                OrderStatus::PaymentPending,
                OrderStatus::Confirmed,
            ]
        );
        assert_eq!(history.order.transaction_id(), Some("txn_0001"));
    }

    #[tokio::test]
    async fn cart_failure_does_not_block_confirmation() {
        let h = harness().stocked().await;
        h.cart.set_fail(true);
        let (order_id, _) = h.pending_order().await;

        let verification = h.pay(order_id, PaymentOutcome::Captured).await;

        assert_eq!(verification.status, OrderStatus::Confirmed);
        assert!(h.cart.cleared().is_empty());
    }
}

mod stock_rejection {
    use super::*;

    #[tokio::test]
    async fn insufficient_item_releases_reserved_siblings() {
        let h = harness().stocked().await;
        let mut rx = h.bus.subscribe();
        let cmd = order_for(
            UserId::new(),
            vec![
                LineItem::new("milk-1l", 2, Money::from_minor(6_000)),
                LineItem::new("atta-5kg", 4, Money::from_minor(27_500)),
            ],
        );
        let order_id = cmd.order_id;

        let placed = h.machine.place_order(cmd).await.unwrap();

        assert_eq!(placed.status, OrderStatus::StockRejected);
        assert!(placed.payment_intent.is_none());
        let rejection = placed.rejection.unwrap();
        assert_eq!(rejection.reason, RejectionReason::InsufficientStock);
        assert_eq!(rejection.product_id, Some(atta()));
        assert_eq!(rejection.requested, Some(4));
        assert_eq!(rejection.available, Some(3));

        assert_eq!(h.reserved(&milk()).await, 0);
        let holds = h.ledger.reservations_for_order(order_id).await.unwrap();
        assert_eq!(holds.len(), 1);
        assert!(holds.iter().all(|r| r.state == ReservationState::Released));
        assert_eq!(h.gateway.intent_count(), 0);

        match rx.recv().await.unwrap() {
            StorefrontEvent::OrderStockRejected {
                reason, available, ..
            } => {
                assert_eq!(reason, "insufficient_stock");
                assert_eq!(available, Some(3));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_product_is_rejected() {
        let h = harness().stocked().await;
        let cmd = order_for(
            UserId::new(),
            vec![LineItem::new("saffron-1g", 1, Money::from_minor(45_000))],
        );

        let placed = h.machine.place_order(cmd).await.unwrap();

        assert_eq!(placed.status, OrderStatus::StockRejected);
        assert_eq!(
            placed.rejection.unwrap().reason,
            RejectionReason::ProductNotFound
        );
    }

    #[tokio::test]
    async fn busy_product_lease_rejects_with_lock_unavailable() {
        let h = harness_with_stock_retry(RetryPolicy::new(3, Duration::from_millis(1)))
            .stocked()
            .await;
        let _held = h
            .lock
            .acquire(&atta().lock_key(), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let placed = h.machine.place_order(basket()).await.unwrap();

        assert_eq!(placed.status, OrderStatus::StockRejected);
        assert_eq!(
            placed.rejection.unwrap().reason,
            RejectionReason::LockUnavailable
        );
        assert_eq!(h.reserved(&milk()).await, 0);
    }

    #[tokio::test]
    async fn racing_orders_for_scarce_stock_sell_once() {
        let h = harness();
        h.ledger.restock(&milk(), 5).await.unwrap();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let machine = h.machine.clone();
                tokio::spawn(async move {
                    let cmd = order_for(
                        UserId::new(),
                        vec![LineItem::new("milk-1l", 3, Money::from_minor(6_000))],
                    );
                    machine.place_order(cmd).await
                })
            })
            .collect();

        let mut placed = Vec::new();
        for task in tasks {
            placed.push(task.await.unwrap().unwrap());
        }

        let pending = placed
            .iter()
            .filter(|p| p.status == OrderStatus::PaymentPending)
            .count();
        assert_eq!(pending, 1);
        let rejected = placed
            .iter()
            .find(|p| p.status == OrderStatus::StockRejected)
            .unwrap();
        assert_eq!(rejected.rejection.as_ref().unwrap().available, Some(2));

        let stock = h.ledger.stock(&milk()).await.unwrap();
        assert_eq!(stock.reserved_quantity, 3);
        assert!(stock.is_consistent());
    }

    #[tokio::test]
    async fn invalid_basket_never_touches_stock() {
        let h = harness().stocked().await;
        let cmd = order_for(UserId::new(), vec![]);

        let err = h.machine.place_order(cmd).await.unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Domain(DomainError::Order(OrderError::NoItems))
        ));
        assert_eq!(h.reserved(&milk()).await, 0);
    }
}

mod payment_failures {
    use super::*;

    #[tokio::test]
    async fn forged_evidence_fails_and_flags_order() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        let forged = EvidenceSigner::new("not-the-secret")
            .evidence(order_id, "pi_0001", "txn_1", PaymentOutcome::Captured)
            .unwrap();

        let first = h.coordinator.verify(order_id, &forged).await.unwrap();
        let second = h.coordinator.verify(order_id, &forged).await.unwrap();

        assert_eq!(first.verdict, Verdict::Invalid);
        assert_eq!(first.status, OrderStatus::PaymentFailed);
        assert_eq!(second.status, OrderStatus::PaymentFailed);

        let order = h.machine.load(order_id).await.unwrap();
        assert!(order.flagged_for_fraud());
        assert_eq!(order.failure_reason(), Some("invalid_signature"));
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.available(&milk()).await, 5);

        let movements = h.ledger.movements(&milk()).await.unwrap();
        let count = |kind| movements.iter().filter(|m| m.kind == kind).count();
        assert_eq!(count(MovementKind::Release), 1);
        assert_eq!(count(MovementKind::Confirm), 0);
    }

    #[tokio::test]
    async fn evidence_for_another_intent_is_invalid() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        let evidence = EvidenceSigner::new(SECRET)
            .evidence(order_id, "pi_9999", "txn_1", PaymentOutcome::Captured)
            .unwrap();

        let verification = h.coordinator.verify(order_id, &evidence).await.unwrap();

        assert_eq!(verification.verdict, Verdict::Invalid);
        assert_eq!(verification.status, OrderStatus::PaymentFailed);
    }

    #[tokio::test]
    async fn forged_capture_cannot_undo_confirmation() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.pay(order_id, PaymentOutcome::Captured).await;

        let mut forged = h
            .gateway
            .settle(order_id, PaymentOutcome::Captured)
            .unwrap()
            .unwrap();
        forged.signature = "00".repeat(32);
        let verification = h.coordinator.verify(order_id, &forged).await.unwrap();

        assert_eq!(verification.verdict, Verdict::Invalid);
        assert_eq!(verification.status, OrderStatus::Confirmed);
        assert!(!h.machine.load(order_id).await.unwrap().flagged_for_fraud());
    }

    #[tokio::test]
    async fn decline_returns_stock() {
        let h = harness().stocked().await;
        let mut rx = h.bus.subscribe();
        let (order_id, _) = h.pending_order().await;

        let verification = h
            .pay(
                order_id,
                PaymentOutcome::Declined {
                    reason: "insufficient_funds".into(),
                },
            )
            .await;

        assert_eq!(verification.verdict, Verdict::Declined);
        assert_eq!(verification.status, OrderStatus::PaymentFailed);
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.reserved(&atta()).await, 0);

        let order = h.machine.load(order_id).await.unwrap();
        assert_eq!(order.failure_reason(), Some("declined"));
        assert!(!order.flagged_for_fraud());

        match rx.recv().await.unwrap() {
            StorefrontEvent::OrderPaymentFailed {
                reason,
                flagged_for_fraud,
                refund_required,
                ..
            } => {
                assert_eq!(reason, "declined");
                assert!(!flagged_for_fraud);
                assert!(!refund_required);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn gateway_outage_releases_stock_and_fails_order() {
        let h = harness().stocked().await;
        h.gateway.set_fail_on_create(true);
        let cmd = basket();
        let order_id = cmd.order_id;

        let err = h.machine.place_order(cmd).await.unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Gateway(GatewayError::Unavailable(_))
        ));
        let order = h.machine.load(order_id).await.unwrap();
        assert_eq!(order.status(), OrderStatus::PaymentFailed);
        assert_eq!(order.failure_reason(), Some("gateway_unavailable"));
        assert_eq!(h.reserved(&milk()).await, 0);
    }

    #[tokio::test]
    async fn capture_after_reservation_window_owes_refund() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.clock.advance(WINDOW + Duration::from_secs(1));

        let verification = h.pay(order_id, PaymentOutcome::Captured).await;

        assert_eq!(verification.verdict, Verdict::Confirmed);
        assert_eq!(verification.status, OrderStatus::PaymentFailed);
        let order = h.machine.load(order_id).await.unwrap();
        assert!(order.refund_required());
        assert_eq!(order.failure_reason(), Some("reservation_expired"));
        assert_eq!(h.available(&milk()).await, 5);
        assert_eq!(h.reserved(&milk()).await, 0);
    }

    #[tokio::test]
    async fn capture_after_decline_records_refund_owed() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.pay(
            order_id,
            PaymentOutcome::Declined {
                reason: "timeout".into(),
            },
        )
        .await;

        let verification = h.pay(order_id, PaymentOutcome::Captured).await;

        assert_eq!(verification.status, OrderStatus::PaymentFailed);
        let order = h.machine.load(order_id).await.unwrap();
        assert!(order.refund_required());
        assert_eq!(order.failure_reason(), Some("declined"));
        assert_eq!(h.available(&milk()).await, 5);
    }
}

mod expiry {
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn swept_reservation_fails_waiting_order() {
        let h = harness().stocked().await;
        let shutdown = CancellationToken::new();
        let listener = ExpiryListener::new(h.machine.clone()).spawn(&h.bus, shutdown.clone());
        let sweeper = ReservationSweeper::new(h.ledger.clone(), h.bus.clone(), SweeperConfig::default());
        let (order_id, _) = h.pending_order().await;

        h.clock.advance(WINDOW + Duration::from_secs(1));
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.expired, 2);

        let mut status = OrderStatus::PaymentPending;
        for _ in 0..100 {
            status = h.machine.load(order_id).await.unwrap().status();
            if status == OrderStatus::PaymentFailed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        listener.await.unwrap();

        assert_eq!(status, OrderStatus::PaymentFailed);
        let order = h.machine.load(order_id).await.unwrap();
        assert_eq!(order.failure_reason(), Some("reservation_expired"));
        assert!(!order.refund_required());
        assert_eq!(h.available(&milk()).await, 5);
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.reserved(&atta()).await, 0);
    }

    #[tokio::test]
    async fn expiry_blocked_by_busy_order_is_redelivered() {
        let h = harness().stocked().await;
        let listener = ExpiryListener::new(h.machine.clone());
        let sweeper = ReservationSweeper::new(h.ledger.clone(), h.bus.clone(), SweeperConfig::default());
        let mut rx = h.bus.subscribe();
        let (order_id, _) = h.pending_order().await;

        h.clock.advance(WINDOW + Duration::from_secs(1));
        let key = format!("order:{order_id}");
        let token = h.lock.acquire(&key, Duration::from_secs(60)).await.unwrap().unwrap();

        let first = sweeper.sweep_once().await.unwrap();
        assert_eq!(first.expired, 2);
        let missed = drain_expiries(&mut rx);
        assert_eq!(missed.len(), 2);
        for event in &missed {
            assert!(matches!(
                listener.handle(event).await,
                Err(CheckoutError::Lock(_))
            ));
        }
        assert_eq!(
            h.machine.load(order_id).await.unwrap().status(),
            OrderStatus::PaymentPending
        );

        assert!(h.lock.release(&key, &token).await.unwrap());
        let second = sweeper.sweep_once().await.unwrap();
        assert_eq!((second.expired, second.redelivered), (0, 2));
        for event in drain_expiries(&mut rx) {
            listener.handle(&event).await.unwrap();
        }

        let order = h.machine.load(order_id).await.unwrap();
        assert_eq!(order.status(), OrderStatus::PaymentFailed);
        assert_eq!(order.failure_reason(), Some("reservation_expired"));
        assert_eq!(sweeper.sweep_once().await.unwrap().redelivered, 0);
    }

    #[tokio::test]
    async fn expiry_of_confirmed_order_changes_nothing() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.pay(order_id, PaymentOutcome::Captured).await;
        let reservation_id = h.machine.load(order_id).await.unwrap().reservation_ids()[0];
        let listener = ExpiryListener::new(h.machine.clone());

        let status = listener
            .handle(&StorefrontEvent::ReservationExpired {
                reservation_id,
                order_id,
                product_id: milk(),
                quantity: 2,
            })
            .await
            .unwrap();

        assert_eq!(status, Some(OrderStatus::Confirmed));
    }

    #[tokio::test]
    async fn expiry_of_foreign_reservation_is_ignored() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;

        let status = h
            .machine
            .on_reservation_expired(order_id, ReservationId::new())
            .await
            .unwrap();

        assert_eq!(status, OrderStatus::PaymentPending);
        assert_eq!(h.reserved(&milk()).await, 2);
    }

    #[tokio::test]
    async fn listener_skips_other_events() {
        let h = harness();
        let listener = ExpiryListener::new(h.machine.clone());
        let event = StorefrontEvent::OrderCancelled {
            order: events::OrderSummary {
                order_id: AggregateId::new(),
                user_id: UserId::new(),
                items: vec![],
                amount_minor: 0,
                currency: "INR".into(),
            },
            reason: "test".into(),
        };

        assert_eq!(listener.handle(&event).await.unwrap(), None);
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn cancelling_pending_order_returns_stock() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;

        let status = h.machine.cancel_order(order_id, "changed mind").await.unwrap();
        let again = h.machine.cancel_order(order_id, "changed mind").await.unwrap();

        assert_eq!(status, OrderStatus::Cancelled);
        assert_eq!(again, OrderStatus::Cancelled);
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.available(&milk()).await, 5);
        assert_eq!(h.store.event_count().await, 4);
    }

    #[tokio::test]
    async fn cancelling_rejected_order_has_no_stock_effect() {
        let h = harness().stocked().await;
        let cmd = order_for(
            UserId::new(),
            vec![LineItem::new("atta-5kg", 9, Money::from_minor(27_500))],
        );
        let placed = h.machine.place_order(cmd).await.unwrap();

        let status = h
            .machine
            .cancel_order(placed.order_id, "out of stock")
            .await
            .unwrap();

        assert_eq!(status, OrderStatus::Cancelled);
        assert_eq!(h.reserved(&atta()).await, 0);
        assert_eq!(h.available(&atta()).await, 3);
    }

    #[tokio::test]
    async fn confirmed_order_cannot_be_cancelled() {
        let h = harness().stocked().await;
        let (order_id, _) = h.pending_order().await;
        h.pay(order_id, PaymentOutcome::Captured).await;

        let err = h.machine.cancel_order(order_id, "too late").await.unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Domain(DomainError::Order(OrderError::InvalidStateTransition {
                current_state: OrderStatus::Confirmed,
                ..
            }))
        ));
        assert_eq!(h.available(&milk()).await, 3);
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let h = harness();
        let id = AggregateId::new();

        assert!(matches!(
            h.machine.cancel_order(id, "?").await,
            Err(CheckoutError::OrderNotFound(found)) if found == id
        ));
        assert!(matches!(
            h.machine.get_order(id).await,
            Err(CheckoutError::OrderNotFound(_))
        ));
    }
}

mod interrupted_checkout {
    use super::*;

    #[tokio::test]
    async fn unrecorded_reservations_reject_order_and_return_stock() {
        let h = harness().stocked().await;
        let journal = FlakyJournal::default();
        journal.refuse(&["StockReserved"]);
        let machine = machine_over(&h, journal, Arc::new(h.gateway.clone()));
        let cmd = basket();
        let order_id = cmd.order_id;

        let err = machine.place_order(cmd).await.unwrap_err();

        assert!(matches!(err, CheckoutError::Domain(_)));
        let order = machine.load(order_id).await.unwrap();
        assert_eq!(order.status(), OrderStatus::StockRejected);
        assert_eq!(
            order.rejection().map(|r| r.reason),
            Some(RejectionReason::CheckoutInterrupted)
        );
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.reserved(&atta()).await, 0);
        assert_eq!(h.gateway.intent_count(), 0);
    }

    #[tokio::test]
    async fn lapsed_holds_of_interrupted_checkout_reject_order() {
        let h = harness().stocked().await;
        let journal = FlakyJournal::default();
        journal.refuse(&["StockReserved", "StockRejected"]);
        let machine = machine_over(&h, journal.clone(), Arc::new(h.gateway.clone()));
        let listener = ExpiryListener::new(machine.clone());
        let sweeper = ReservationSweeper::new(h.ledger.clone(), h.bus.clone(), SweeperConfig::default());
        let mut rx = h.bus.subscribe();
        let cmd = basket();
        let order_id = cmd.order_id;

        machine.place_order(cmd).await.unwrap_err();
        assert_eq!(
            machine.load(order_id).await.unwrap().status(),
            OrderStatus::Created
        );
        assert_eq!(h.reserved(&milk()).await, 2);

        journal.refuse(&[]);
        h.clock.advance(WINDOW + Duration::from_secs(1));
        assert_eq!(sweeper.sweep_once().await.unwrap().expired, 2);
        for event in drain_expiries(&mut rx) {
            listener.handle(&event).await.unwrap();
        }

        let order = machine.load(order_id).await.unwrap();
        assert_eq!(order.status(), OrderStatus::StockRejected);
        assert_eq!(
            order.rejection().map(|r| r.reason),
            Some(RejectionReason::CheckoutInterrupted)
        );
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.available(&milk()).await, 5);
        assert_eq!(sweeper.sweep_once().await.unwrap().redelivered, 0);
    }

    #[tokio::test]
    async fn checkout_lease_covers_every_line_item_and_the_gateway() {
        let h = harness();
        let config = h.machine.config();
        let ledger = h.ledger.config();

        let per_item = ledger.lock_retry.max_wait() + ledger.lease_duration;
        assert_eq!(
            h.machine.checkout_lease(3),
            config.lease_duration + per_item * 3 + config.gateway_timeout
        );
        assert!(h.machine.checkout_lease(usize::MAX) >= h.machine.checkout_lease(3));
    }

    #[tokio::test]
    async fn cancel_waits_for_slow_checkout() {
        let h = harness().stocked().await;
        let gateway = Arc::new(SlowGateway {
            inner: h.gateway.clone(),
            clock: h.clock.clone(),
            entered: Notify::new(),
            proceed: Notify::new(),
        });
        let machine = machine_over(&h, InMemoryEventStore::new(), gateway.clone());
        let cmd = basket();
        let order_id = cmd.order_id;

        let checkout = tokio::spawn({
            let machine = machine.clone();
            async move { machine.place_order(cmd).await }
        });
        gateway.entered.notified().await;

        // The clock is now past the plain order lease.
        let cancel = tokio::spawn({
            let machine = machine.clone();
            async move { machine.cancel_order(order_id, "changed mind").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cancel.is_finished());
        gateway.proceed.notify_one();

        let placed = checkout.await.unwrap().unwrap();
        assert_eq!(placed.status, OrderStatus::PaymentPending);
        assert_eq!(cancel.await.unwrap().unwrap(), OrderStatus::Cancelled);
        assert_eq!(h.reserved(&milk()).await, 0);
        assert_eq!(h.available(&milk()).await, 5);
    }

    #[tokio::test]
    async fn silent_gateway_times_out_and_fails_order() {
        let h = harness().stocked().await;
        let gateway = Arc::new(SlowGateway {
            inner: h.gateway.clone(),
            clock: h.clock.clone(),
            entered: Notify::new(),
            proceed: Notify::new(),
        });
        let config = CheckoutConfig {
            gateway_timeout: Duration::from_millis(20),
            ..h.machine.config().clone()
        };
        let machine = Arc::new(OrderStateMachine::new(
            OrderService::with_clock(InMemoryEventStore::new(), Arc::new(h.clock.clone())),
            h.ledger.clone(),
            h.lock.clone(),
            gateway,
            Arc::new(h.cart.clone()),
            h.bus.clone(),
            config,
        ));
        let cmd = basket();
        let order_id = cmd.order_id;

        let err = machine.place_order(cmd).await.unwrap_err();

        assert!(matches!(err, CheckoutError::Gateway(GatewayError::Unavailable(_))));
        let order = machine.load(order_id).await.unwrap();
        assert_eq!(order.status(), OrderStatus::PaymentFailed);
        assert_eq!(order.failure_reason(), Some("gateway_unavailable"));
        assert_eq!(h.reserved(&milk()).await, 0);
    }
}
