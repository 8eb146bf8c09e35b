//! Checkout orchestration for the storefront core.
//!
//! - [`OrderStateMachine`]: takes an order from CREATED to a terminal state,
//!   reserving, confirming and releasing stock through the ledger.
//! - [`PaymentCoordinator`]: authenticates gateway evidence and feeds the
//!   verdict into the state machine.
//! - [`ExpiryListener`]: turns `reservation.expired` events into order
//!   transitions.
//! - [`PaymentGateway`] / [`CartService`]: the external collaborators
//!   checkout calls directly, with in-memory implementations.

pub mod cart;
pub mod coordinator;
pub mod error;
pub mod evidence;
pub mod gateway;
pub mod listener;
pub mod machine;

pub use cart::{CartService, InMemoryCartService};
pub use coordinator::{PaymentCoordinator, PaymentVerification, Verdict};
pub use error::{CartError, CheckoutError, GatewayError, Result};
pub use evidence::{EvidenceSigner, GatewayEvidence, PaymentOutcome, SignatureError, signed_payload};
pub use gateway::{InMemoryPaymentGateway, Intent, PaymentGateway};
pub use listener::ExpiryListener;
pub use machine::{CheckoutConfig, OrderStateMachine, PlacedOrder};
