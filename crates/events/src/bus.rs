//! In-process event bus backed by a `tokio::sync::broadcast` channel.

use tokio::sync::broadcast;

use crate::StorefrontEvent;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// Fire-and-forget sink for storefront events.
///
/// Implementations must not block the caller and must not fail: collaborator
/// availability never affects an order transition.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: StorefrontEvent);
}

/// In-process fan-out event bus.
///
/// Every subscriber independently receives every event published after it
/// subscribed.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<StorefrontEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed events are dropped and
    /// slow receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorefrontEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventPublisher for EventBus {
    #[tracing::instrument(skip(self, event), fields(event_type = event.event_type(), order_id = %event.order_id()))]
    fn publish(&self, event: StorefrontEvent) {
        // A send error only means nobody is subscribed.
        if self.sender.send(event).is_err() {
            tracing::debug!("no subscribers for storefront event");
        }
    }
}

#[cfg(test)]
mod tests {
    use common::{AggregateId, ProductId, ReservationId};

    use super::*;

    fn expired() -> StorefrontEvent {
        StorefrontEvent::ReservationExpired {
            reservation_id: ReservationId::new(),
            order_id: AggregateId::new(),
            product_id: ProductId::new("bread"),
            quantity: 1,
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_the_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let event = expired();

        bus.publish(event.clone());

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(expired());
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..3 {
            bus.publish(expired());
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
    }
}
