//! Order route handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{ProductId, ReservationId, UserId};
use domain::{
    DeliveryAddress, LineItem, Money, OrderHistory, OrderStatus, PaymentMethod, PlaceOrder,
    TimelineEntry,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::parse_order_id;
use crate::error::ApiError;
use crate::state::AppState;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub items: Vec<OrderItemRequest>,
    #[serde(default)]
    pub delivery_address: DeliveryAddress,
    #[serde(default)]
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_minor: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: String,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub status: OrderStatus,
    pub payment_intent: Option<String>,
}

/// Body of a 409 when a line item could not be reserved.
#[derive(Debug, Serialize)]
pub struct StockRejectedResponse {
    pub error: &'static str,
    pub order_id: String,
    pub status: OrderStatus,
    pub reason: &'static str,
    pub product_id: Option<ProductId>,
    pub requested: Option<u32>,
    pub available: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price_minor: i64,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub user_id: Option<UserId>,
    pub status: OrderStatus,
    pub items: Vec<OrderItemResponse>,
    pub total_minor: i64,
    pub currency: String,
    pub payment_ref: Option<String>,
    pub reservation_ids: Vec<ReservationId>,
    pub flagged_for_fraud: bool,
    pub refund_required: bool,
    pub failure_reason: Option<&'static str>,
    pub timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: OrderStatus,
}

impl OrderResponse {
    fn from_history(order_id: String, history: OrderHistory) -> Self {
        let order = &history.order;
        Self {
            order_id,
            user_id: order.user_id(),
            status: order.status(),
            items: order
                .items()
                .iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                    unit_price_minor: item.unit_price.minor(),
                })
                .collect(),
            total_minor: order.total_amount().minor(),
            currency: order.currency().to_string(),
            payment_ref: order.payment_ref().map(str::to_string),
            reservation_ids: order.reservation_ids().to_vec(),
            flagged_for_fraud: order.flagged_for_fraud(),
            refund_required: order.refund_required(),
            failure_reason: order.failure_reason(),
            timeline: history.timeline,
        }
    }
}

// -- Handlers --

/// POST /orders: places an order, reserves its stock and opens a payment
/// intent. A stock rejection is a 409 carrying the failing line item.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<Response, ApiError> {
    let items = req
        .items
        .into_iter()
        .map(|item| {
            LineItem::new(
                item.product_id,
                item.quantity,
                Money::from_minor(item.unit_price_minor),
            )
        })
        .collect();

    let cmd = PlaceOrder::new(
        UserId::from_uuid(req.user_id),
        items,
        state.machine.config().currency.clone(),
        req.delivery_address,
        req.payment_method,
    );

    let placed = state.machine.place_order(cmd).await?;
    let order_id = placed.order_id.to_string();

    if let Some(rejection) = placed.rejection {
        let body = StockRejectedResponse {
            error: "stock rejected",
            order_id,
            status: placed.status,
            reason: rejection.reason.as_str(),
            product_id: rejection.product_id,
            requested: rejection.requested,
            available: rejection.available,
        };
        return Ok((StatusCode::CONFLICT, Json(body)).into_response());
    }

    let body = CreateOrderResponse {
        order_id,
        status: placed.status,
        payment_intent: placed.payment_intent,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// GET /orders/{id}: current state plus the full timeline.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let history = state.machine.get_order(order_id).await?;
    Ok(Json(OrderResponse::from_history(
        order_id.to_string(),
        history,
    )))
}

/// POST /orders/{id}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let status = state.machine.cancel_order(order_id, &req.reason).await?;
    Ok(Json(StatusResponse { status }))
}

/// POST /orders/{id}/refund
pub async fn refund(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReasonRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let status = state.machine.refund_order(order_id, &req.reason).await?;
    Ok(Json(StatusResponse { status }))
}
