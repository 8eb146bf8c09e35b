//! Stock ledger: the reservation protocol.
//!
//! Every mutation of a product's stock happens while holding that product's
//! lease, and is written with a compare-and-set on the row version. The lease
//! orders writers; the version check catches a writer whose lease lapsed
//! mid-operation. A version conflict is retried once, then reported.
//!
//! Reservation lifecycle:
//!
//! ```text
//! reserve ──► PENDING ──confirm──► CONFIRMED
//!                │ ├────release──► RELEASED
//!                │ └─────expire──► EXPIRED   (sweeper, only past expires_at)
//! ```
//!
//! `confirm`, `release` and `expire` are idempotent: calling them on a
//! reservation that already left PENDING changes nothing.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{AggregateId, Clock, ProductId, ReservationId, RetryPolicy, deadline, retry};

use crate::error::{LedgerError, Result};
use crate::lock::{Lease, LockService, acquire_with_retry};
use crate::model::{
    MovementKind, ProductStock, Reservation, ReservationState, ReservationWrite, StockChange,
    StockMovement,
};
use crate::store::StockStore;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a pending reservation holds stock.
    pub reservation_window: Duration,
    /// Lifetime of a product lease.
    pub lease_duration: Duration,
    /// Bound on lease acquisition attempts.
    pub lock_retry: RetryPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_window: Duration::from_secs(600),
            lease_duration: Duration::from_millis(5000),
            lock_retry: RetryPolicy::default(),
        }
    }
}

pub struct StockLedger {
    lock: Arc<dyn LockService>,
    store: Arc<dyn StockStore>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl StockLedger {
    pub fn new(
        lock: Arc<dyn LockService>,
        store: Arc<dyn StockStore>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            lock,
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Adds physical stock, creating the product row on first use.
    #[tracing::instrument(skip(self), fields(product_id = %product_id))]
    pub async fn restock(&self, product_id: &ProductId, quantity: u32) -> Result<ProductStock> {
        validate_quantity(quantity)?;

        self.with_lease(product_id.lock_key(), || {
            self.with_version_retry(|| self.try_restock(product_id, quantity))
        })
        .await
    }

    pub async fn stock(&self, product_id: &ProductId) -> Result<ProductStock> {
        self.store
            .load_stock(product_id)
            .await?
            .ok_or_else(|| LedgerError::ProductNotFound(product_id.clone()))
    }

    /// Holds `quantity` units of `product_id` for `order_id`.
    ///
    /// Fails with `InsufficientStock` carrying the free quantity when the
    /// product cannot cover the request.
    #[tracing::instrument(skip(self), fields(product_id = %product_id, order_id = %order_id))]
    pub async fn reserve(
        &self,
        product_id: &ProductId,
        quantity: u32,
        order_id: AggregateId,
    ) -> Result<Reservation> {
        validate_quantity(quantity)?;

        let result = self
            .with_lease(product_id.lock_key(), || {
                self.with_version_retry(|| self.try_reserve(product_id, quantity, order_id))
            })
            .await;

        let outcome = match &result {
            Ok(_) => "reserved",
            Err(LedgerError::InsufficientStock { .. }) => "insufficient_stock",
            Err(LedgerError::LockUnavailable { .. }) => "lock_unavailable",
            Err(_) => "error",
        };
        metrics::counter!("stock_reservations_total", "outcome" => outcome).increment(1);

        if let Ok(reservation) = &result {
            tracing::info!(
                reservation_id = %reservation.reservation_id,
                quantity,
                expires_at = %reservation.expires_at,
                "stock reserved"
            );
        }
        result
    }

    /// Confirms a single reservation. See [`StockLedger::confirm_all`].
    pub async fn confirm(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let mut confirmed = self.confirm_all(&[reservation_id]).await?;
        confirmed
            .pop()
            .ok_or(LedgerError::ReservationNotFound(reservation_id))
    }

    /// Turns pending reservations into sales.
    ///
    /// The leases of every product involved are taken in sorted key order.
    /// Every reservation is checked before anything is written: if one was
    /// released, expired, or is past its window, nothing is confirmed and
    /// `ReservationExpired` is returned.
    ///
    /// Each product is its own stock row, so the writes are committed one
    /// reservation at a time. A store error part-way leaves the earlier
    /// reservations CONFIRMED and the rest PENDING. Calling again with the
    /// same ids finishes the job: already confirmed reservations are skipped.
    #[tracing::instrument(skip(self), fields(count = reservation_ids.len()))]
    pub async fn confirm_all(&self, reservation_ids: &[ReservationId]) -> Result<Vec<Reservation>> {
        let ids: BTreeSet<ReservationId> = reservation_ids.iter().copied().collect();

        let mut keys = BTreeSet::new();
        for id in &ids {
            keys.insert(self.load_reservation(*id).await?.product_id.lock_key());
        }

        let leases = self.acquire_all(keys).await?;
        let result = self
            .with_version_retry(|| self.try_confirm_all(&ids))
            .await;
        self.release_leases(leases).await;

        result
    }

    /// Returns a pending reservation's stock to the free pool. A no-op on a
    /// reservation that is no longer pending.
    #[tracing::instrument(skip(self), fields(reservation_id = %reservation_id))]
    pub async fn release(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let (reservation, _) = self
            .resolve_pending(reservation_id, ReservationState::Released)
            .await?;
        Ok(reservation)
    }

    /// Releases each reservation in turn.
    pub async fn release_all(&self, reservation_ids: &[ReservationId]) -> Result<Vec<Reservation>> {
        let mut released = Vec::with_capacity(reservation_ids.len());
        for id in reservation_ids {
            released.push(self.release(*id).await?);
        }
        Ok(released)
    }

    /// Expires a pending reservation whose window has passed.
    ///
    /// Returns the expired reservation, or `None` when there was nothing to
    /// do (already resolved, or not yet due).
    #[tracing::instrument(skip(self), fields(reservation_id = %reservation_id))]
    pub async fn expire(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        let (reservation, changed) = self
            .resolve_pending(reservation_id, ReservationState::Expired)
            .await?;
        Ok(changed.then_some(reservation))
    }

    pub async fn reservations_for_order(&self, order_id: AggregateId) -> Result<Vec<Reservation>> {
        Ok(self.store.reservations_for_order(order_id).await?)
    }

    pub async fn movements(&self, product_id: &ProductId) -> Result<Vec<StockMovement>> {
        Ok(self.store.movements(product_id).await?)
    }

    /// Pending reservations past their window, at most `limit`.
    pub async fn due_for_expiry(&self, limit: usize) -> Result<Vec<Reservation>> {
        Ok(self.store.pending_expired(self.clock.now(), limit).await?)
    }

    /// Expired reservations whose order has not acknowledged the expiry yet,
    /// at most `limit`.
    pub async fn unacknowledged_expiries(&self, limit: usize) -> Result<Vec<Reservation>> {
        Ok(self.store.unacknowledged_expiries(limit).await?)
    }

    /// Records that the owning order has reacted to the expiry, so the
    /// sweeper stops redelivering it. `false` when there was nothing to mark.
    pub async fn acknowledge_expiry(&self, reservation_id: ReservationId) -> Result<bool> {
        Ok(self
            .store
            .acknowledge_expiry(reservation_id, self.clock.now())
            .await?)
    }

    async fn load_reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.store
            .load_reservation(reservation_id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))
    }

    /// Moves a pending reservation to `target`. The flag tells whether this
    /// call made the change.
    async fn resolve_pending(
        &self,
        reservation_id: ReservationId,
        target: ReservationState,
    ) -> Result<(Reservation, bool)> {
        let reservation = self.load_reservation(reservation_id).await?;
        if reservation.state.is_resolved() {
            return Ok((reservation, false));
        }

        self.with_lease(reservation.product_id.lock_key(), || {
            self.with_version_retry(|| self.try_resolve(reservation_id, target))
        })
        .await
    }

    async fn try_restock(&self, product_id: &ProductId, quantity: u32) -> Result<ProductStock> {
        let now = self.clock.now();
        let stock = self
            .store
            .load_stock(product_id)
            .await?
            .unwrap_or_else(|| ProductStock::empty(product_id.clone(), now));

        let available = stock
            .available_quantity
            .checked_add(quantity)
            .ok_or(LedgerError::InvalidQuantity(quantity))?;
        let next = stock.next(available, stock.reserved_quantity, now);
        let movement = StockMovement::record(MovementKind::Restock, quantity, &next, None);

        self.commit(&stock, next.clone(), None, movement).await?;
        tracing::info!(quantity, available, "product restocked");
        Ok(next)
    }

    async fn try_reserve(
        &self,
        product_id: &ProductId,
        quantity: u32,
        order_id: AggregateId,
    ) -> Result<Reservation> {
        let stock = self.stock(product_id).await?;

        let available = stock.free_quantity();
        if available < quantity {
            return Err(LedgerError::InsufficientStock {
                product_id: product_id.clone(),
                requested: quantity,
                available,
            });
        }

        let now = self.clock.now();
        let reservation = Reservation::pending(
            order_id,
            product_id.clone(),
            quantity,
            now,
            deadline(now, self.config.reservation_window),
        );
        let next = stock.next(
            stock.available_quantity,
            stock.reserved_quantity + quantity,
            now,
        );
        let movement =
            StockMovement::record(MovementKind::Reserve, quantity, &next, Some(&reservation));

        self.commit(
            &stock,
            next,
            Some(ReservationWrite::Insert(reservation.clone())),
            movement,
        )
        .await?;
        Ok(reservation)
    }

    async fn try_confirm_all(&self, ids: &BTreeSet<ReservationId>) -> Result<Vec<Reservation>> {
        let now = self.clock.now();

        let mut reservations = Vec::with_capacity(ids.len());
        for id in ids {
            let reservation = self.load_reservation(*id).await?;
            match reservation.state {
                ReservationState::Confirmed => {}
                ReservationState::Released | ReservationState::Expired => {
                    return Err(LedgerError::ReservationExpired { reservation_id: *id });
                }
                ReservationState::Pending if reservation.is_past_expiry(now) => {
                    return Err(LedgerError::ReservationExpired { reservation_id: *id });
                }
                ReservationState::Pending => {}
            }
            reservations.push(reservation);
        }

        let mut confirmed = Vec::with_capacity(reservations.len());
        for reservation in reservations {
            if reservation.state == ReservationState::Confirmed {
                confirmed.push(reservation);
                continue;
            }

            let stock = self.stock(&reservation.product_id).await?;
            let (available, reserved) = match (
                stock.available_quantity.checked_sub(reservation.quantity),
                stock.reserved_quantity.checked_sub(reservation.quantity),
            ) {
                (Some(a), Some(r)) => (a, r),
                _ => return Err(invariant_violation(&stock)),
            };

            let resolved = reservation.resolve(ReservationState::Confirmed, now);
            let next = stock.next(available, reserved, now);
            let movement = StockMovement::record(
                MovementKind::Confirm,
                reservation.quantity,
                &next,
                Some(&resolved),
            );
            self.commit(
                &stock,
                next,
                Some(ReservationWrite::Update(resolved.clone())),
                movement,
            )
            .await?;

            metrics::counter!("stock_confirmations_total").increment(1);
            tracing::info!(
                reservation_id = %resolved.reservation_id,
                product_id = %resolved.product_id,
                quantity = resolved.quantity,
                "reservation confirmed"
            );
            confirmed.push(resolved);
        }

        Ok(confirmed)
    }

    async fn try_resolve(
        &self,
        reservation_id: ReservationId,
        target: ReservationState,
    ) -> Result<(Reservation, bool)> {
        // Re-read under the lease: someone may have resolved it meanwhile.
        let reservation = self.load_reservation(reservation_id).await?;
        if reservation.state.is_resolved() {
            return Ok((reservation, false));
        }

        let now = self.clock.now();
        if target == ReservationState::Expired && !reservation.is_past_expiry(now) {
            return Ok((reservation, false));
        }

        let stock = self.stock(&reservation.product_id).await?;
        let reserved = stock
            .reserved_quantity
            .checked_sub(reservation.quantity)
            .ok_or_else(|| invariant_violation(&stock))?;

        let kind = match target {
            ReservationState::Expired => MovementKind::Expire,
            _ => MovementKind::Release,
        };
        let resolved = reservation.resolve(target, now);
        let next = stock.next(stock.available_quantity, reserved, now);
        let movement = StockMovement::record(kind, reservation.quantity, &next, Some(&resolved));

        self.commit(
            &stock,
            next,
            Some(ReservationWrite::Update(resolved.clone())),
            movement,
        )
        .await?;

        match target {
            ReservationState::Expired => {
                metrics::counter!("reservations_expired_total").increment(1);
            }
            _ => metrics::counter!("stock_releases_total").increment(1),
        }
        tracing::info!(
            reservation_id = %reservation_id,
            order_id = %resolved.order_id,
            quantity = resolved.quantity,
            state = %resolved.state,
            "reservation resolved"
        );
        Ok((resolved, true))
    }

    async fn commit(
        &self,
        current: &ProductStock,
        next: ProductStock,
        reservation: Option<ReservationWrite>,
        movement: StockMovement,
    ) -> Result<()> {
        let product_id = next.product_id.clone();
        let change = StockChange {
            expected_version: current.version,
            stock: next,
            reservation,
            movement,
        };

        if self.store.commit(change).await? {
            Ok(())
        } else {
            Err(LedgerError::VersionConflict { product_id })
        }
    }

    async fn with_version_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(&RetryPolicy::once(), operation, |e| {
            matches!(e, LedgerError::VersionConflict { .. })
        })
        .await
    }

    /// Runs `operation` while holding the lease on `key`. The lease is given
    /// back whatever the outcome.
    async fn with_lease<T, F, Fut>(&self, key: String, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = acquire_with_retry(
            self.lock.as_ref(),
            &key,
            self.config.lease_duration,
            &self.config.lock_retry,
        )
        .await?;

        let result = operation().await;
        lease.release(self.lock.as_ref()).await;
        result
    }

    async fn acquire_all(&self, keys: BTreeSet<String>) -> Result<Vec<Lease>> {
        let mut leases = Vec::with_capacity(keys.len());
        for key in keys {
            match acquire_with_retry(
                self.lock.as_ref(),
                &key,
                self.config.lease_duration,
                &self.config.lock_retry,
            )
            .await
            {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    self.release_leases(leases).await;
                    return Err(e.into());
                }
            }
        }
        Ok(leases)
    }

    async fn release_leases(&self, leases: Vec<Lease>) {
        for lease in leases.into_iter().rev() {
            lease.release(self.lock.as_ref()).await;
        }
    }
}

fn validate_quantity(quantity: u32) -> Result<()> {
    if quantity == 0 {
        return Err(LedgerError::InvalidQuantity(quantity));
    }
    Ok(())
}

fn invariant_violation(stock: &ProductStock) -> LedgerError {
    LedgerError::Store(crate::error::StoreError::InvariantViolation(
        stock.product_id.clone(),
    ))
}
