//! Payment confirmation handlers.
//!
//! The shopper's client and the gateway webhook report through separate
//! routes; both end in the same coordinator call.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use checkout::{GatewayEvidence, PaymentVerification};
use serde::Deserialize;

use super::parse_order_id;
use crate::error::ApiError;
use crate::state::AppState;

/// Header the gateway may carry the evidence signature in.
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub order_id: String,
    #[serde(flatten)]
    pub evidence: GatewayEvidence,
}

/// POST /orders/{id}/payment: synchronous verify from the shopper's client.
pub async fn confirm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(evidence): Json<GatewayEvidence>,
) -> Result<Json<PaymentVerification>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let verification = state.coordinator.verify(order_id, &evidence).await?;
    Ok(Json(verification))
}

/// POST /webhooks/payment: asynchronous delivery from the gateway.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<WebhookRequest>,
) -> Result<Json<PaymentVerification>, ApiError> {
    let order_id = parse_order_id(&req.order_id)?;

    let mut evidence = req.evidence;
    if evidence.signature.is_empty() {
        if let Some(signature) = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            evidence.signature = signature.to_string();
        }
    }

    let verification = state.coordinator.verify(order_id, &evidence).await?;
    tracing::info!(
        %order_id,
        verdict = %verification.verdict,
        status = %verification.status,
        "payment webhook processed"
    );
    Ok(Json(verification))
}
