//! Payment confirmation coordinator.
//!
//! The shopper's client and the gateway webhook may both report the same
//! payment. Both land here; the state machine's per-order lease and its
//! idempotent handlers make the second report a no-op.

use std::fmt;
use std::sync::Arc;

use common::AggregateId;
use domain::{FailureReason, OrderStatus, PaymentFailure};
use event_store::EventStore;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::evidence::{EvidenceSigner, GatewayEvidence, PaymentOutcome};
use crate::machine::OrderStateMachine;

/// How the coordinator judged a piece of gateway evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Authentic capture.
    Confirmed,
    /// Authentic decline.
    Declined,
    /// Failed authentication; treated as fraud.
    Invalid,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Confirmed => "confirmed",
            Verdict::Declined => "declined",
            Verdict::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The verdict plus the order status once it was acted on. A late decline
/// reads `Declined` with status `CONFIRMED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaymentVerification {
    pub verdict: Verdict,
    pub status: OrderStatus,
}

pub struct PaymentCoordinator<S: EventStore> {
    machine: Arc<OrderStateMachine<S>>,
    signer: EvidenceSigner,
}

impl<S: EventStore> PaymentCoordinator<S> {
    pub fn new(machine: Arc<OrderStateMachine<S>>, signer: EvidenceSigner) -> Self {
        Self { machine, signer }
    }

    /// Authenticates the evidence and applies it to the order.
    ///
    /// Evidence is `Invalid` when its signature does not verify or when it
    /// names a payment intent other than the order's own. Invalid evidence
    /// fails a pending order and flags it for fraud; it is never retried.
    #[tracing::instrument(skip(self, evidence), fields(intent_ref = %evidence.intent_ref))]
    pub async fn verify(
        &self,
        order_id: AggregateId,
        evidence: &GatewayEvidence,
    ) -> Result<PaymentVerification> {
        let order = self.machine.load(order_id).await?;

        let authentic = match self.signer.verify(order_id, evidence) {
            Err(e) => Err(e.to_string()),
            Ok(()) if order.payment_ref() != Some(evidence.intent_ref.as_str()) => {
                Err("evidence names another payment intent".to_string())
            }
            Ok(()) => Ok(()),
        };

        let (verdict, status) = match (authentic, &evidence.outcome) {
            (Err(detail), _) => {
                tracing::warn!(%detail, "gateway evidence rejected");
                let failure = PaymentFailure::new(FailureReason::InvalidSignature).with_detail(detail);
                let status = self.machine.on_payment_failed(order_id, failure).await?;
                (Verdict::Invalid, status)
            }
            (Ok(()), PaymentOutcome::Captured) => {
                let status = self
                    .machine
                    .on_payment_confirmed(order_id, &evidence.transaction_id)
                    .await?;
                (Verdict::Confirmed, status)
            }
            (Ok(()), PaymentOutcome::Declined { reason }) => {
                let failure = PaymentFailure::new(FailureReason::Declined).with_detail(reason.clone());
                let status = self.machine.on_payment_failed(order_id, failure).await?;
                (Verdict::Declined, status)
            }
        };

        metrics::counter!("payment_verifications_total", "verdict" => verdict.as_str()).increment(1);
        tracing::info!(%verdict, %status, "payment evidence applied");
        Ok(PaymentVerification { verdict, status })
    }
}
