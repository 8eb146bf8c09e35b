//! Feeds `reservation.expired` events from the bus back into the order
//! state machine.
//!
//! Delivery is at least once: an expiry the machine fails to apply, or one
//! this listener never sees, stays unacknowledged on the ledger and the
//! sweeper publishes it again on its next tick.

use std::sync::Arc;

use domain::OrderStatus;
use event_store::EventStore;
use events::{EventBus, StorefrontEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::machine::OrderStateMachine;

pub struct ExpiryListener<S: EventStore> {
    machine: Arc<OrderStateMachine<S>>,
}

impl<S: EventStore + 'static> ExpiryListener<S> {
    pub fn new(machine: Arc<OrderStateMachine<S>>) -> Self {
        Self { machine }
    }

    /// Applies one event. Returns the order's status for expiry events and
    /// `None` for everything else.
    pub async fn handle(&self, event: &StorefrontEvent) -> Result<Option<OrderStatus>> {
        match event {
            StorefrontEvent::ReservationExpired {
                reservation_id,
                order_id,
                ..
            } => {
                let status = self
                    .machine
                    .on_reservation_expired(*order_id, *reservation_id)
                    .await?;
                Ok(Some(status))
            }
            _ => Ok(None),
        }
    }

    async fn run(self, mut receiver: broadcast::Receiver<StorefrontEvent>, shutdown: CancellationToken) {
        tracing::info!("expiry listener started");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => received,
            };

            match received {
                Ok(event) => {
                    if let Err(e) = self.handle(&event).await {
                        tracing::warn!(
                            order_id = %event.order_id(),
                            error = %e,
                            "failed to apply reservation expiry, awaiting redelivery"
                        );
                    }
                }
                // Unacknowledged expiries are announced again by the sweeper.
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "expiry listener lagged, events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }

        tracing::info!("expiry listener stopped");
    }

    /// Subscribes before returning, so no expiry published afterwards is
    /// missed.
    pub fn spawn(self, bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let receiver = bus.subscribe();
        tokio::spawn(self.run(receiver, shutdown))
    }
}
