//! Inventory authority for the storefront.
//!
//! - [`LockService`]: short-lived, tokenized leases, one per product key.
//! - [`StockLedger`]: available/reserved accounting and the reserve, confirm,
//!   release and expire transitions, each performed under the product lease.
//! - [`StockStore`]: persistence behind the ledger, in memory or PostgreSQL.
//! - [`ReservationSweeper`]: reclaims reservations nobody confirmed in time.
//!
//! Correctness rests on one invariant: for every product,
//! `available_quantity >= reserved_quantity >= 0`.

pub mod error;
pub mod ledger;
pub mod lock;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;
pub mod sweeper;

pub use error::{LedgerError, LockError, Result, StoreError};
pub use ledger::{LedgerConfig, StockLedger};
pub use lock::{InMemoryLockService, Lease, LeaseToken, LockService, acquire_with_retry};
pub use memory::InMemoryStockStore;
pub use model::{
    MovementKind, ProductStock, Reservation, ReservationState, ReservationWrite, StockChange,
    StockMovement,
};
pub use postgres::{PostgresLockService, PostgresStockStore};
pub use store::StockStore;
pub use sweeper::{ReservationSweeper, SweepReport, SweeperConfig};
