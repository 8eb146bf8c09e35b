//! Gateway evidence and its HMAC-SHA256 authentication.
//!
//! The gateway signs `"{orderId}|{intentRef}|{transactionId}|{outcome}"`
//! with a secret shared with the storefront, and sends the hex-encoded MAC
//! along with the outcome. Nothing in the evidence is trusted until the MAC
//! checks out.

use std::fmt;

use common::AggregateId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// What the gateway says happened to the payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Captured,
    Declined { reason: String },
}

impl PaymentOutcome {
    /// The outcome as it appears in the signed payload.
    pub fn code(&self) -> String {
        match self {
            PaymentOutcome::Captured => "captured".to_string(),
            PaymentOutcome::Declined { reason } => format!("declined:{reason}"),
        }
    }
}

/// A payment result reported by the gateway, either through the shopper's
/// client or the gateway webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEvidence {
    pub intent_ref: String,
    pub transaction_id: String,
    pub outcome: PaymentOutcome,
    /// Hex-encoded HMAC-SHA256. May be absent from a webhook body when the
    /// gateway sends it as a header instead.
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signing key rejected")]
    InvalidKey,

    #[error("Signature missing")]
    Missing,

    #[error("Signature is not valid hex")]
    Encoding,

    #[error("Signature mismatch")]
    Mismatch,
}

/// The string the gateway signs.
pub fn signed_payload(
    order_id: AggregateId,
    intent_ref: &str,
    transaction_id: &str,
    outcome: &PaymentOutcome,
) -> String {
    format!(
        "{order_id}|{intent_ref}|{transaction_id}|{}",
        outcome.code()
    )
}

/// Signs and verifies gateway evidence with the shared secret.
#[derive(Clone)]
pub struct EvidenceSigner {
    secret: Vec<u8>,
}

impl EvidenceSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256, SignatureError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| SignatureError::InvalidKey)?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    pub fn sign(
        &self,
        order_id: AggregateId,
        intent_ref: &str,
        transaction_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<String, SignatureError> {
        let payload = signed_payload(order_id, intent_ref, transaction_id, outcome);
        Ok(hex::encode(self.mac(&payload)?.finalize().into_bytes()))
    }

    /// Checks the evidence signature in constant time.
    pub fn verify(
        &self,
        order_id: AggregateId,
        evidence: &GatewayEvidence,
    ) -> Result<(), SignatureError> {
        if evidence.signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let signature =
            hex::decode(evidence.signature.trim()).map_err(|_| SignatureError::Encoding)?;

        let payload = signed_payload(
            order_id,
            &evidence.intent_ref,
            &evidence.transaction_id,
            &evidence.outcome,
        );
        self.mac(&payload)?
            .verify_slice(&signature)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Builds evidence signed with this secret, the way the gateway would.
    pub fn evidence(
        &self,
        order_id: AggregateId,
        intent_ref: impl Into<String>,
        transaction_id: impl Into<String>,
        outcome: PaymentOutcome,
    ) -> Result<GatewayEvidence, SignatureError> {
        let intent_ref = intent_ref.into();
        let transaction_id = transaction_id.into();
        let signature = self.sign(order_id, &intent_ref, &transaction_id, &outcome)?;
        Ok(GatewayEvidence {
            intent_ref,
            transaction_id,
            outcome,
            signature,
        })
    }
}

impl fmt::Debug for EvidenceSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceSigner")
            .field("secret", &"<redacted>")
            .finish()
    }
}
