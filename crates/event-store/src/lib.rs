//! Order journal.
//!
//! Every order state transition is stored as an immutable event. The journal
//! is both the source of truth for rebuilding an order and the timeline shown
//! to callers. Appends are guarded by an expected [`Version`] so two
//! concurrent transitions of the same order cannot both win.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{AppendOptions, EventStore, EventStoreExt};
