//! Shared building blocks for the storefront core.

pub mod clock;
pub mod retry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, deadline};
pub use retry::{RetryPolicy, retry};
pub use types::{AggregateId, ProductId, ReservationId, UserId};
