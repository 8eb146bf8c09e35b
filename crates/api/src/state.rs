//! Shared state handed to every handler.

use std::sync::Arc;

use checkout::{OrderStateMachine, PaymentCoordinator};
use event_store::EventStore;
use inventory::StockLedger;

/// The order journal as the process sees it: in memory or PostgreSQL,
/// chosen at start-up.
pub type Journal = Arc<dyn EventStore>;

pub struct AppState {
    pub machine: Arc<OrderStateMachine<Journal>>,
    pub coordinator: PaymentCoordinator<Journal>,
    pub ledger: Arc<StockLedger>,
}
