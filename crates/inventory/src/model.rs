use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{AggregateId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Authoritative stock of one product.
///
/// `available_quantity` is physical stock not yet sold; `reserved_quantity`
/// is the part of it held by pending reservations. A row at version 0 has
/// never been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub available_quantity: u32,
    pub reserved_quantity: u32,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ProductStock {
    /// A product nobody has stocked yet.
    pub fn empty(product_id: ProductId, at: DateTime<Utc>) -> Self {
        Self {
            product_id,
            available_quantity: 0,
            reserved_quantity: 0,
            version: 0,
            updated_at: at,
        }
    }

    /// Quantity a new reservation may claim.
    pub fn free_quantity(&self) -> u32 {
        self.available_quantity
            .saturating_sub(self.reserved_quantity)
    }

    pub fn is_consistent(&self) -> bool {
        self.available_quantity >= self.reserved_quantity
    }

    /// The next version of this row with new quantities.
    pub(crate) fn next(&self, available: u32, reserved: u32, at: DateTime<Utc>) -> Self {
        Self {
            product_id: self.product_id.clone(),
            available_quantity: available,
            reserved_quantity: reserved,
            version: self.version + 1,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Pending,
    Confirmed,
    Released,
    Expired,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Pending => "PENDING",
            ReservationState::Confirmed => "CONFIRMED",
            ReservationState::Released => "RELEASED",
            ReservationState::Expired => "EXPIRED",
        }
    }

    /// Anything but `Pending` is final.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ReservationState::Pending)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ReservationState::Pending),
            "CONFIRMED" => Ok(ReservationState::Confirmed),
            "RELEASED" => Ok(ReservationState::Released),
            "EXPIRED" => Ok(ReservationState::Expired),
            other => Err(StoreError::Corrupt(format!(
                "unknown reservation state '{other}'"
            ))),
        }
    }
}

/// A hold of `quantity` units of one product for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn pending(
        order_id: AggregateId,
        product_id: ProductId,
        quantity: u32,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            reservation_id: ReservationId::new(),
            order_id,
            product_id,
            quantity,
            state: ReservationState::Pending,
            created_at,
            expires_at,
            resolved_at: None,
        }
    }

    /// True once the window has passed, whatever the state.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub(crate) fn resolve(&self, state: ReservationState, at: DateTime<Utc>) -> Self {
        Self {
            state,
            resolved_at: Some(at),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Restock,
    Reserve,
    Confirm,
    Release,
    Expire,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Restock => "RESTOCK",
            MovementKind::Reserve => "RESERVE",
            MovementKind::Confirm => "CONFIRM",
            MovementKind::Release => "RELEASE",
            MovementKind::Expire => "EXPIRE",
        }
    }
}

impl FromStr for MovementKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESTOCK" => Ok(MovementKind::Restock),
            "RESERVE" => Ok(MovementKind::Reserve),
            "CONFIRM" => Ok(MovementKind::Confirm),
            "RELEASE" => Ok(MovementKind::Release),
            "EXPIRE" => Ok(MovementKind::Expire),
            other => Err(StoreError::Corrupt(format!("unknown movement kind '{other}'"))),
        }
    }
}

/// Audit record of one change to a product's stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub movement_id: Uuid,
    pub product_id: ProductId,
    pub kind: MovementKind,
    pub quantity: u32,
    pub order_id: Option<AggregateId>,
    pub reservation_id: Option<ReservationId>,
    pub available_after: u32,
    pub reserved_after: u32,
    pub recorded_at: DateTime<Utc>,
}

impl StockMovement {
    pub(crate) fn record(
        kind: MovementKind,
        quantity: u32,
        after: &ProductStock,
        reservation: Option<&Reservation>,
    ) -> Self {
        Self {
            movement_id: Uuid::new_v4(),
            product_id: after.product_id.clone(),
            kind,
            quantity,
            order_id: reservation.map(|r| r.order_id),
            reservation_id: reservation.map(|r| r.reservation_id),
            available_after: after.available_quantity,
            reserved_after: after.reserved_quantity,
            recorded_at: after.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationWrite {
    Insert(Reservation),
    Update(Reservation),
}

impl ReservationWrite {
    pub fn reservation(&self) -> &Reservation {
        match self {
            ReservationWrite::Insert(r) | ReservationWrite::Update(r) => r,
        }
    }
}

/// One atomic write to the stock store.
///
/// Applied only if the stored row is still at `expected_version`; the new
/// row, the reservation write and the movement land together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub expected_version: u64,
    pub stock: ProductStock,
    pub reservation: Option<ReservationWrite>,
    pub movement: StockMovement,
}
