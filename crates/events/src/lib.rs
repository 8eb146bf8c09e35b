//! Event Publisher for the storefront core.
//!
//! - [`StorefrontEvent`]: what the core tells the outside world about order
//!   and reservation transitions.
//! - [`EventBus`]: in-process fan-out backed by `tokio::sync::broadcast`.
//! - [`delivery`]: collaborators (notification, delivery partner, ...) and
//!   the forwarder task that feeds them from the bus.
//!
//! Publishing never blocks and never fails. The state machine does not wait
//! for any collaborator.

pub mod bus;
pub mod delivery;
pub mod event;

pub use bus::{EventBus, EventPublisher};
pub use delivery::{
    Collaborator, DELIVERY_EVENTS, DeliveryError, NOTIFICATION_EVENTS, log::TracingCollaborator,
    spawn_forwarder, webhook::WebhookCollaborator,
};
pub use event::{OrderItem, OrderSummary, StorefrontEvent};
