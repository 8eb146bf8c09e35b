//! External collaborators fed from the [`EventBus`].
//!
//! Each collaborator gets its own forwarder task and its own broadcast
//! receiver, so a slow or failing collaborator never holds up another one,
//! nor the order flow that published the event.

pub mod log;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{EventBus, StorefrontEvent};

/// Events the notification collaborator is interested in.
pub const NOTIFICATION_EVENTS: &[&str] = &[
    "order.confirmed",
    "order.payment_failed",
    "order.stock_rejected",
];

/// Events the delivery-partner collaborator is interested in.
pub const DELIVERY_EVENTS: &[&str] = &["order.confirmed"];

/// Error type for collaborator delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote endpoint returned a non-2xx status code.
    #[error("Collaborator returned HTTP {0}")]
    HttpStatus(u16),
}

impl DeliveryError {
    /// Client errors will not get better by sending the same body again.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Request(_) => true,
            DeliveryError::HttpStatus(status) => *status >= 500 || *status == 429,
        }
    }
}

/// An external party that is told about storefront events.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this collaborator wants the event at all.
    fn accepts(&self, event: &StorefrontEvent) -> bool;

    async fn deliver(&self, event: &StorefrontEvent) -> Result<(), DeliveryError>;
}

/// Subscribes `collaborator` to the bus and delivers every accepted event
/// until `shutdown` fires or the bus is dropped.
///
/// The subscription is taken before this function returns, so nothing
/// published afterwards is missed.
pub fn spawn_forwarder(
    bus: &EventBus,
    collaborator: Arc<dyn Collaborator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();

    tokio::spawn(async move {
        let name = collaborator.name().to_string();
        tracing::info!(collaborator = %name, "collaborator forwarder started");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => received,
            };

            match received {
                Ok(event) => {
                    if !collaborator.accepts(&event) {
                        continue;
                    }
                    match collaborator.deliver(&event).await {
                        Ok(()) => {
                            metrics::counter!("collaborator_deliveries_total", "outcome" => "delivered")
                                .increment(1);
                        }
                        Err(e) => {
                            metrics::counter!("collaborator_deliveries_total", "outcome" => "failed")
                                .increment(1);
                            tracing::error!(
                                collaborator = %name,
                                event_type = event.event_type(),
                                order_id = %event.order_id(),
                                error = %e,
                                "collaborator delivery failed"
                            );
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(collaborator = %name, skipped, "collaborator forwarder lagged, events skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }

        tracing::info!(collaborator = %name, "collaborator forwarder stopped");
    })
}
