use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::courier::{Courier, GeoPoint};
use crate::models::order::DeliveryOrder;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(create_courier).get(list_couriers))
        .route("/couriers/:id/availability", patch(update_courier_availability))
        .route("/couriers/:id/location", patch(update_courier_location))
        .route("/couriers/:id/orders", get(list_assigned_orders))
}

#[derive(Deserialize)]
pub struct CreateCourierRequest {
    pub name: String,
    pub location: GeoPoint,
    #[serde(default = "default_available")]
    pub is_available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub is_available: bool,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

pub(crate) fn validate_location(location: &GeoPoint) -> Result<(), AppError> {
    let valid = location.lat.is_finite()
        && location.lng.is_finite()
        && (-90.0..=90.0).contains(&location.lat)
        && (-180.0..=180.0).contains(&location.lng);

    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "location out of range: lat={}, lng={}",
            location.lat, location.lng
        )))
    }
}

async fn create_courier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCourierRequest>,
) -> Result<Json<Courier>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }
    validate_location(&payload.location)?;

    let mut courier = Courier::new(payload.name, payload.location);
    courier.is_available = payload.is_available;

    state.store.insert_courier(courier.clone()).await?;
    Ok(Json(courier))
}

async fn list_couriers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Courier>>, AppError> {
    Ok(Json(state.store.list_couriers().await?))
}

async fn update_courier_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Courier>, AppError> {
    let courier = state
        .store
        .set_courier_availability(id, payload.is_available)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("courier {} not found", id)))?;

    Ok(Json(courier))
}

async fn update_courier_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Courier>, AppError> {
    validate_location(&payload.location)?;

    let courier = state
        .store
        .set_courier_location(id, payload.location)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("courier {} not found", id)))?;

    Ok(Json(courier))
}

async fn list_assigned_orders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryOrder>>, AppError> {
    Ok(Json(state.coordinator.assigned_orders(id).await?))
}
