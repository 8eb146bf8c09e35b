//! Payment gateway contract and an in-memory gateway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use common::AggregateId;
use domain::Money;

use crate::error::GatewayError;
use crate::evidence::{EvidenceSigner, GatewayEvidence, PaymentOutcome, SignatureError};

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment intent for the order and returns its reference.
    async fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        order_id: AggregateId,
    ) -> Result<String, GatewayError>;
}

/// An intent the in-memory gateway has opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub intent_ref: String,
    pub order_id: AggregateId,
    pub amount: Money,
    pub currency: String,
}

#[derive(Debug, Default)]
struct GatewayState {
    intents: HashMap<AggregateId, Intent>,
    next_id: u32,
    fail_on_create: bool,
    next_txn: u32,
}

/// In-process gateway: hands out `pi_NNNN` references and signs evidence
/// with the same secret the coordinator verifies with.
#[derive(Debug, Clone)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<GatewayState>>,
    signer: EvidenceSigner,
}

impl InMemoryPaymentGateway {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            state: Arc::default(),
            signer: EvidenceSigner::new(secret),
        }
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `create_intent` calls fail until reset.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.state().fail_on_create = fail;
    }

    pub fn intent_count(&self) -> usize {
        self.state().intents.len()
    }

    pub fn intent_for(&self, order_id: AggregateId) -> Option<Intent> {
        self.state().intents.get(&order_id).cloned()
    }

    /// Signed evidence for the order's intent, as the gateway would report
    /// it once the shopper paid (or failed to). `None` when no intent exists.
    pub fn settle(
        &self,
        order_id: AggregateId,
        outcome: PaymentOutcome,
    ) -> Option<Result<GatewayEvidence, SignatureError>> {
        let (intent_ref, transaction_id) = {
            let mut state = self.state();
            let intent_ref = state.intents.get(&order_id)?.intent_ref.clone();
            state.next_txn += 1;
            (intent_ref, format!("txn_{:04}", state.next_txn))
        };
        Some(
            self.signer
                .evidence(order_id, intent_ref, transaction_id, outcome),
        )
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        order_id: AggregateId,
    ) -> Result<String, GatewayError> {
        let mut state = self.state();
        if state.fail_on_create {
            return Err(GatewayError::Unavailable("gateway offline".to_string()));
        }
        if !amount.is_positive() {
            return Err(GatewayError::Rejected(format!("amount {amount} is not payable")));
        }

        if let Some(existing) = state.intents.get(&order_id) {
            return Ok(existing.intent_ref.clone());
        }

        state.next_id += 1;
        let intent_ref = format!("pi_{:04}", state.next_id);
        state.intents.insert(
            order_id,
            Intent {
                intent_ref: intent_ref.clone(),
                order_id,
                amount,
                currency: currency.to_string(),
            },
        );
        tracing::debug!(%order_id, %intent_ref, "payment intent created");
        Ok(intent_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issues_sequential_refs_one_per_order() {
        let gateway = InMemoryPaymentGateway::new("secret");
        let first = AggregateId::new();
        let second = AggregateId::new();

        let a = gateway
            .create_intent(Money::from_minor(1_000), "INR", first)
            .await
            .unwrap();
        let again = gateway
            .create_intent(Money::from_minor(1_000), "INR", first)
            .await
            .unwrap();
        let b = gateway
            .create_intent(Money::from_minor(2_000), "INR", second)
            .await
            .unwrap();

        assert_eq!(a, "pi_0001");
        assert_eq!(again, a);
        assert_eq!(b, "pi_0002");
        assert_eq!(gateway.intent_count(), 2);
    }

    #[tokio::test]
    async fn can_be_made_to_fail() {
        let gateway = InMemoryPaymentGateway::new("secret");
        gateway.set_fail_on_create(true);

        let err = gateway
            .create_intent(Money::from_minor(1_000), "INR", AggregateId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
        assert_eq!(gateway.intent_count(), 0);
    }

    #[tokio::test]
    async fn settle_signs_with_gateway_secret() {
        let gateway = InMemoryPaymentGateway::new("secret");
        let order_id = AggregateId::new();
        assert!(gateway.settle(order_id, PaymentOutcome::Captured).is_none());

        gateway
            .create_intent(Money::from_minor(500), "INR", order_id)
            .await
            .unwrap();
        let evidence = gateway
            .settle(order_id, PaymentOutcome::Captured)
            .unwrap()
            .unwrap();

        assert_eq!(evidence.intent_ref, "pi_0001");
        assert_eq!(evidence.transaction_id, "txn_0001");
        assert!(EvidenceSigner::new("secret").verify(order_id, &evidence).is_ok());
    }
}
