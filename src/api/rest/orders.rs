use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::rest::couriers::validate_location;
use crate::engine::queue::enqueue_order;
use crate::error::AppError;
use crate::models::courier::GeoPoint;
use crate::models::offer::Offer;
use crate::models::order::{DeliveryOrder, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/assign", post(trigger_assignment))
        .route("/orders/:id/accept", patch(accept_order))
        .route("/orders/:id/decline", patch(decline_order))
        .route("/orders/:id/status", patch(report_status))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/offers", get(list_offers))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub restaurant_location: GeoPoint,
}

#[derive(Deserialize)]
pub struct CourierActionRequest {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
pub struct ReportStatusRequest {
    pub courier_id: Uuid,
    pub status: OrderStatus,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<DeliveryOrder>, AppError> {
    validate_location(&payload.restaurant_location)?;

    let order = DeliveryOrder::new(payload.restaurant_location);
    state.store.insert_order(order.clone()).await?;
    enqueue_order(&state, order.id).await?;

    Ok(Json(order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DeliveryOrder>>, AppError> {
    Ok(Json(state.store.list_orders().await?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(state.coordinator.get_order(id).await?))
}

async fn trigger_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(state.coordinator.trigger_assignment(id).await?))
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierActionRequest>,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(
        state
            .coordinator
            .courier_accept(id, payload.courier_id)
            .await?,
    ))
}

async fn decline_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierActionRequest>,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(
        state
            .coordinator
            .courier_decline(id, payload.courier_id)
            .await?,
    ))
}

async fn report_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReportStatusRequest>,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(
        state
            .coordinator
            .courier_report_status(id, payload.courier_id, payload.status)
            .await?,
    ))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(state.coordinator.cancel_order(id).await?))
}

async fn list_offers(State(state): State<Arc<AppState>>) -> Json<Vec<Offer>> {
    Json(state.coordinator.active_offers())
}
