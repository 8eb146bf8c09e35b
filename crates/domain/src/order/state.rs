//! Order lifecycle status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where an order is in its lifecycle.
///
/// ```text
/// CREATED ──► STOCK_RESERVED ──► PAYMENT_PENDING ──► CONFIRMED ──► REFUNDED
///    │              │                  │
///    ▼              └───────┬──────────┘
/// STOCK_REJECTED            ▼
///    │               PAYMENT_FAILED
///    └──────┬───────────────┘
///           ▼
///       CANCELLED
/// ```
///
/// CREATED, STOCK_RESERVED and PAYMENT_PENDING may also be cancelled
/// directly; their reservations are released on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Created,
    StockReserved,
    StockRejected,
    PaymentPending,
    Confirmed,
    PaymentFailed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// CONFIRMED, CANCELLED and REFUNDED. CONFIRMED still allows a refund.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// True while the order may be holding PENDING reservations.
    pub fn holds_reservations(&self) -> bool {
        matches!(
            self,
            OrderStatus::Created | OrderStatus::StockReserved | OrderStatus::PaymentPending
        )
    }

    pub fn can_cancel(&self) -> bool {
        !matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::StockReserved => "STOCK_RESERVED",
            OrderStatus::StockRejected => "STOCK_REJECTED",
            OrderStatus::PaymentPending => "PAYMENT_PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CREATED" => OrderStatus::Created,
            "STOCK_RESERVED" => OrderStatus::StockReserved,
            "STOCK_REJECTED" => OrderStatus::StockRejected,
            "PAYMENT_PENDING" => OrderStatus::PaymentPending,
            "CONFIRMED" => OrderStatus::Confirmed,
            "PAYMENT_FAILED" => OrderStatus::PaymentFailed,
            "CANCELLED" => OrderStatus::Cancelled,
            "REFUNDED" => OrderStatus::Refunded,
            other => return Err(format!("unknown order status '{other}'")),
        })
    }
}
