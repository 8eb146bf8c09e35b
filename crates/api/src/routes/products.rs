//! Stock route handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ProductId;
use inventory::{ProductStock, StockMovement};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RestockRequest {
    pub quantity: u32,
}

/// GET /products/{id}/stock
pub async fn stock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ProductStock>, ApiError> {
    let stock = state.ledger.stock(&ProductId::new(id)).await?;
    Ok(Json(stock))
}

/// POST /products/{id}/restock
pub async fn restock(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RestockRequest>,
) -> Result<Json<ProductStock>, ApiError> {
    let stock = state
        .ledger
        .restock(&ProductId::new(id), req.quantity)
        .await?;
    Ok(Json(stock))
}

/// GET /products/{id}/movements: the audit trail, oldest first.
pub async fn movements(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StockMovement>>, ApiError> {
    let movements = state.ledger.movements(&ProductId::new(id)).await?;
    Ok(Json(movements))
}
