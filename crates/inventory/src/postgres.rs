//! PostgreSQL stock store and lease service.
//!
//! Tables come from the workspace migrations (`product_stock`,
//! `reservations`, `stock_movements`, `leases`). Quantities are `BIGINT`
//! columns; values outside `u32` are reported as corrupt rather than
//! truncated.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AggregateId, ProductId, ReservationId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::error::{LockError, StoreError};
use crate::lock::{LeaseToken, LockService};
use crate::model::{
    ProductStock, Reservation, ReservationWrite, StockChange, StockMovement,
};
use crate::store::StockStore;

const RESERVATION_COLUMNS: &str = "SELECT reservation_id, order_id, product_id, quantity, state, created_at, expires_at, resolved_at FROM reservations";

#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_stock(row: PgRow) -> Result<ProductStock, StoreError> {
        Ok(ProductStock {
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            available_quantity: to_u32(row.try_get("available_quantity")?)?,
            reserved_quantity: to_u32(row.try_get("reserved_quantity")?)?,
            version: u64::try_from(row.try_get::<i64, _>("version")?)
                .map_err(|_| StoreError::Corrupt("negative stock version".to_string()))?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_reservation(row: PgRow) -> Result<Reservation, StoreError> {
        Ok(Reservation {
            reservation_id: ReservationId::from_uuid(row.try_get("reservation_id")?),
            order_id: AggregateId::from_uuid(row.try_get("order_id")?),
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            quantity: to_u32(row.try_get("quantity")?)?,
            state: row.try_get::<String, _>("state")?.parse()?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    fn row_to_movement(row: PgRow) -> Result<StockMovement, StoreError> {
        Ok(StockMovement {
            movement_id: row.try_get("movement_id")?,
            product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
            kind: row.try_get::<String, _>("kind")?.parse()?,
            quantity: to_u32(row.try_get("quantity")?)?,
            order_id: row
                .try_get::<Option<Uuid>, _>("order_id")?
                .map(AggregateId::from_uuid),
            reservation_id: row
                .try_get::<Option<Uuid>, _>("reservation_id")?
                .map(ReservationId::from_uuid),
            available_after: to_u32(row.try_get("available_after")?)?,
            reserved_after: to_u32(row.try_get("reserved_after")?)?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    /// Writes the stock row if it is still at `expected_version`.
    async fn write_stock(
        tx: &mut Transaction<'_, Postgres>,
        expected_version: u64,
        stock: &ProductStock,
    ) -> Result<bool, StoreError> {
        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO product_stock (product_id, available_quantity, reserved_quantity, version, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (product_id) DO NOTHING
                "#,
            )
            .bind(stock.product_id.as_str())
            .bind(i64::from(stock.available_quantity))
            .bind(i64::from(stock.reserved_quantity))
            .bind(to_i64(stock.version)?)
            .bind(stock.updated_at)
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE product_stock
                SET available_quantity = $2, reserved_quantity = $3, version = $4, updated_at = $5
                WHERE product_id = $1 AND version = $6
                "#,
            )
            .bind(stock.product_id.as_str())
            .bind(i64::from(stock.available_quantity))
            .bind(i64::from(stock.reserved_quantity))
            .bind(to_i64(stock.version)?)
            .bind(stock.updated_at)
            .bind(to_i64(expected_version)?)
            .execute(&mut **tx)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    async fn write_reservation(
        tx: &mut Transaction<'_, Postgres>,
        write: &ReservationWrite,
    ) -> Result<(), StoreError> {
        match write {
            ReservationWrite::Insert(r) => {
                sqlx::query(
                    r#"
                    INSERT INTO reservations (reservation_id, order_id, product_id, quantity, state, created_at, expires_at, resolved_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(r.reservation_id.as_uuid())
                .bind(r.order_id.as_uuid())
                .bind(r.product_id.as_str())
                .bind(i64::from(r.quantity))
                .bind(r.state.as_str())
                .bind(r.created_at)
                .bind(r.expires_at)
                .bind(r.resolved_at)
                .execute(&mut **tx)
                .await?;
            }
            ReservationWrite::Update(r) => {
                sqlx::query(
                    "UPDATE reservations SET state = $2, resolved_at = $3 WHERE reservation_id = $1",
                )
                .bind(r.reservation_id.as_uuid())
                .bind(r.state.as_str())
                .bind(r.resolved_at)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    async fn load_stock(&self, product_id: &ProductId) -> Result<Option<ProductStock>, StoreError> {
        sqlx::query(
            "SELECT product_id, available_quantity, reserved_quantity, version, updated_at FROM product_stock WHERE product_id = $1",
        )
        .bind(product_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_stock)
        .transpose()
    }

    async fn load_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        sqlx::query(&format!("{RESERVATION_COLUMNS} WHERE reservation_id = $1"))
            .bind(reservation_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_reservation)
            .transpose()
    }

    async fn reservations_for_order(
        &self,
        order_id: AggregateId,
    ) -> Result<Vec<Reservation>, StoreError> {
        sqlx::query(&format!(
            "{RESERVATION_COLUMNS} WHERE order_id = $1 ORDER BY created_at ASC"
        ))
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Self::row_to_reservation)
        .collect()
    }

    async fn pending_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>, StoreError> {
        sqlx::query(&format!(
            "{RESERVATION_COLUMNS} WHERE state = 'PENDING' AND expires_at < $1 ORDER BY expires_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Self::row_to_reservation)
        .collect()
    }

    async fn unacknowledged_expiries(&self, limit: usize) -> Result<Vec<Reservation>, StoreError> {
        sqlx::query(&format!(
            "{RESERVATION_COLUMNS} WHERE state = 'EXPIRED' AND expiry_acknowledged_at IS NULL ORDER BY resolved_at ASC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Self::row_to_reservation)
        .collect()
    }

    async fn acknowledge_expiry(
        &self,
        reservation_id: ReservationId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE reservations SET expiry_acknowledged_at = $2
            WHERE reservation_id = $1 AND state = 'EXPIRED' AND expiry_acknowledged_at IS NULL
            "#,
        )
        .bind(reservation_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn movements(&self, product_id: &ProductId) -> Result<Vec<StockMovement>, StoreError> {
        sqlx::query(
            r#"
            SELECT movement_id, product_id, kind, quantity, order_id, reservation_id,
                   available_after, reserved_after, recorded_at
            FROM stock_movements
            WHERE product_id = $1
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(product_id.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Self::row_to_movement)
        .collect()
    }

    async fn commit(&self, change: StockChange) -> Result<bool, StoreError> {
        if !change.stock.is_consistent() {
            return Err(StoreError::InvariantViolation(change.stock.product_id));
        }

        let mut tx = self.pool.begin().await?;

        if !Self::write_stock(&mut tx, change.expected_version, &change.stock).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(write) = &change.reservation {
            Self::write_reservation(&mut tx, write).await?;
        }

        let m = &change.movement;
        sqlx::query(
            r#"
            INSERT INTO stock_movements (movement_id, product_id, kind, quantity, order_id, reservation_id, available_after, reserved_after, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(m.movement_id)
        .bind(m.product_id.as_str())
        .bind(m.kind.as_str())
        .bind(i64::from(m.quantity))
        .bind(m.order_id.map(|id| id.as_uuid()))
        .bind(m.reservation_id.map(|id| id.as_uuid()))
        .bind(i64::from(m.available_after))
        .bind(i64::from(m.reserved_after))
        .bind(m.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

/// Lease table in PostgreSQL.
///
/// Expiry is judged by the database clock, so every server sharing the
/// database agrees on when a lease lapses.
#[derive(Clone)]
pub struct PostgresLockService {
    pool: PgPool,
}

impl PostgresLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PostgresLockService {
    async fn acquire(
        &self,
        key: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeaseToken>, LockError> {
        let token = LeaseToken::new();

        // Inserts a fresh lease or takes over a lapsed one; a live lease makes
        // the conditional update match nothing.
        let acquired: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO leases (resource_key, token, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (resource_key) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE leases.expires_at < NOW()
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(token.as_uuid())
        .bind(lease_duration.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(acquired.map(LeaseToken::from_uuid))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM leases WHERE resource_key = $1 AND token = $2")
            .bind(key)
            .bind(token.as_uuid())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("quantity {value} out of range")))
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("version {value} out of range")))
}
