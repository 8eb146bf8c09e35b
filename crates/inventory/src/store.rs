use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, ProductId, ReservationId};

use crate::error::StoreError;
use crate::model::{ProductStock, Reservation, StockChange, StockMovement};

/// Persistence for stock rows, reservations and the movement audit trail.
///
/// Reads are plain; every write goes through [`StockStore::commit`], which is
/// a compare-and-set on the product's version.
#[async_trait]
pub trait StockStore: Send + Sync {
    async fn load_stock(&self, product_id: &ProductId) -> Result<Option<ProductStock>, StoreError>;

    async fn load_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError>;

    async fn reservations_for_order(
        &self,
        order_id: AggregateId,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Pending reservations whose window ended before `now`, oldest first.
    async fn pending_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Expired reservations whose order has not taken note of the expiry
    /// yet, earliest expiry first.
    async fn unacknowledged_expiries(&self, limit: usize) -> Result<Vec<Reservation>, StoreError>;

    /// Marks an expired reservation as handled by its order. Returns `false`
    /// when it was not expired or had already been acknowledged.
    async fn acknowledge_expiry(
        &self,
        reservation_id: ReservationId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Audit trail of one product, oldest first.
    async fn movements(&self, product_id: &ProductId) -> Result<Vec<StockMovement>, StoreError>;

    /// Applies `change` atomically. Returns `false`, writing nothing, when the
    /// stored row is no longer at `change.expected_version`.
    async fn commit(&self, change: StockChange) -> Result<bool, StoreError>;
}
