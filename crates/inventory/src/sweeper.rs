//! Background reclamation of abandoned reservations.
//!
//! The sweeper is the only component that acts on reservation expiry. Each
//! tick it asks the ledger for pending reservations past their window,
//! expires them (re-checked under the product lease) and announces each one
//! as `reservation.expired` so the order flow can react.
//!
//! The announcement is repeated on later ticks until the order flow
//! acknowledges the expiry through [`StockLedger::acknowledge_expiry`]. A
//! failed or missed hand-off is therefore retried from the stored
//! reservation, not lost with the broadcast.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use events::{EventPublisher, StorefrontEvent};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ledger::StockLedger;
use crate::model::Reservation;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Upper bound on reservations expired, and on expiries redelivered,
    /// per tick.
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Due reservations found.
    pub scanned: usize,
    /// Reservations this sweep moved to EXPIRED.
    pub expired: usize,
    /// Reservations whose expiry failed; retried next tick.
    pub failed: usize,
    /// Earlier expiries announced again because no order acknowledged them.
    pub redelivered: usize,
}

pub struct ReservationSweeper {
    ledger: Arc<StockLedger>,
    publisher: Arc<dyn EventPublisher>,
    config: SweeperConfig,
}

impl ReservationSweeper {
    pub fn new(
        ledger: Arc<StockLedger>,
        publisher: Arc<dyn EventPublisher>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            ledger,
            publisher,
            config,
        }
    }

    /// Expires every due reservation, up to the batch size, then announces
    /// again the older expiries no order has acknowledged.
    ///
    /// A failure on one reservation is logged and counted; the rest of the
    /// batch still runs.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let due = self.ledger.due_for_expiry(self.config.batch_size).await?;
        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };
        let mut announced = HashSet::new();

        for reservation in due {
            match self.ledger.expire(reservation.reservation_id).await {
                Ok(Some(expired)) => {
                    report.expired += 1;
                    announced.insert(expired.reservation_id);
                    self.announce(expired);
                }
                // Confirmed or released between the scan and the lease.
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        reservation_id = %reservation.reservation_id,
                        error = %e,
                        "failed to expire reservation"
                    );
                }
            }
        }

        match self
            .ledger
            .unacknowledged_expiries(self.config.batch_size)
            .await
        {
            Ok(waiting) => {
                for reservation in waiting {
                    if announced.contains(&reservation.reservation_id) {
                        continue;
                    }
                    report.redelivered += 1;
                    self.announce(reservation);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load unacknowledged expiries"),
        }

        metrics::counter!("sweeper_runs_total").increment(1);
        if report.redelivered > 0 {
            metrics::counter!("reservation_expiries_redelivered_total")
                .increment(report.redelivered as u64);
        }
        if report.scanned > 0 || report.redelivered > 0 {
            tracing::info!(
                scanned = report.scanned,
                expired = report.expired,
                failed = report.failed,
                redelivered = report.redelivered,
                "reservation sweep finished"
            );
        }
        Ok(report)
    }

    fn announce(&self, reservation: Reservation) {
        self.publisher.publish(StorefrontEvent::ReservationExpired {
            reservation_id: reservation.reservation_id,
            order_id: reservation.order_id,
            product_id: reservation.product_id,
            quantity: reservation.quantity,
        });
    }

    /// Sweeps on a fixed interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "reservation sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "reservation sweep failed");
                    }
                }
            }
        }

        tracing::info!("reservation sweeper stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
