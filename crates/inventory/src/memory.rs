use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, ProductId, ReservationId};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{
    ProductStock, Reservation, ReservationState, ReservationWrite, StockChange, StockMovement,
};
use crate::store::StockStore;

#[derive(Debug, Default)]
struct Tables {
    stock: HashMap<ProductId, ProductStock>,
    reservations: HashMap<ReservationId, Reservation>,
    by_order: HashMap<AggregateId, Vec<ReservationId>>,
    /// `(expires_at, id)` of every pending reservation.
    pending_by_expiry: BTreeSet<(DateTime<Utc>, ReservationId)>,
    /// `(resolved_at, id)` of expired reservations not yet acknowledged.
    unacknowledged: BTreeSet<(DateTime<Utc>, ReservationId)>,
    movements: HashMap<ProductId, Vec<StockMovement>>,
}

impl Tables {
    fn write_reservation(&mut self, write: ReservationWrite) {
        let reservation = match write {
            ReservationWrite::Insert(r) => {
                self.by_order
                    .entry(r.order_id)
                    .or_default()
                    .push(r.reservation_id);
                r
            }
            ReservationWrite::Update(r) => r,
        };

        let previous = self
            .reservations
            .get(&reservation.reservation_id)
            .map(|r| (r.state, r.expires_at));
        if let Some((ReservationState::Pending, expires_at)) = previous {
            self.pending_by_expiry
                .remove(&(expires_at, reservation.reservation_id));
        }
        if reservation.state == ReservationState::Pending {
            self.pending_by_expiry
                .insert((reservation.expires_at, reservation.reservation_id));
        }
        if reservation.state == ReservationState::Expired
            && !matches!(previous, Some((ReservationState::Expired, _)))
        {
            self.unacknowledged
                .insert((expiry_key(&reservation), reservation.reservation_id));
        }
        self.reservations
            .insert(reservation.reservation_id, reservation);
    }
}

fn expiry_key(reservation: &Reservation) -> DateTime<Utc> {
    reservation.resolved_at.unwrap_or(reservation.expires_at)
}

/// Stock store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reservations still pending.
    pub async fn pending_count(&self) -> usize {
        self.tables.read().await.pending_by_expiry.len()
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn load_stock(&self, product_id: &ProductId) -> Result<Option<ProductStock>, StoreError> {
        Ok(self.tables.read().await.stock.get(product_id).cloned())
    }

    async fn load_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .reservations
            .get(&reservation_id)
            .cloned())
    }

    async fn reservations_for_order(
        &self,
        order_id: AggregateId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_order
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.reservations.get(id).cloned())
            .collect())
    }

    async fn pending_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .pending_by_expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at < now)
            .take(limit)
            .filter_map(|(_, id)| tables.reservations.get(id).cloned())
            .collect())
    }

    async fn unacknowledged_expiries(&self, limit: usize) -> Result<Vec<Reservation>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .unacknowledged
            .iter()
            .take(limit)
            .filter_map(|(_, id)| tables.reservations.get(id).cloned())
            .collect())
    }

    async fn acknowledge_expiry(
        &self,
        reservation_id: ReservationId,
        _at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(key) = tables
            .reservations
            .get(&reservation_id)
            .filter(|r| r.state == ReservationState::Expired)
            .map(expiry_key)
        else {
            return Ok(false);
        };
        Ok(tables.unacknowledged.remove(&(key, reservation_id)))
    }

    async fn movements(&self, product_id: &ProductId) -> Result<Vec<StockMovement>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .movements
            .get(product_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, change: StockChange) -> Result<bool, StoreError> {
        // Same rule as the CHECK constraint on product_stock.
        if !change.stock.is_consistent() {
            return Err(StoreError::InvariantViolation(change.stock.product_id));
        }

        let mut tables = self.tables.write().await;
        let current_version = tables
            .stock
            .get(&change.stock.product_id)
            .map_or(0, |s| s.version);
        if current_version != change.expected_version {
            return Ok(false);
        }

        let StockChange {
            stock,
            reservation,
            movement,
            ..
        } = change;

        if let Some(write) = reservation {
            tables.write_reservation(write);
        }
        tables
            .movements
            .entry(stock.product_id.clone())
            .or_default()
            .push(movement);
        tables.stock.insert(stock.product_id.clone(), stock);

        Ok(true)
    }
}
