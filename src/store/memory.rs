//! In-memory geo store.
//!
//! Backs the service when no external store is configured and drives the test
//! suite. Conditional writes hold the DashMap shard lock for the record they
//! touch, which makes each CAS atomic with respect to every other writer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::{Expected, GeoStore, NearbyCourier, TransitionOutcome};
use crate::error::AppError;
use crate::geo::haversine_m;
use crate::models::courier::{Courier, GeoPoint};
use crate::models::order::{DeliveryOrder, OrderFields, OrderStatus};

#[derive(Debug, Default)]
pub struct InMemoryGeoStore {
    couriers: DashMap<Uuid, Courier>,
    orders: DashMap<Uuid, DeliveryOrder>,
    unavailable: AtomicBool,
}

impl InMemoryGeoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`AppError::Retryable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Retryable("geo store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GeoStore for InMemoryGeoStore {
    async fn insert_order(&self, order: DeliveryOrder) -> Result<(), AppError> {
        self.check_available()?;
        self.orders.insert(order.id, order);
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<DeliveryOrder>, AppError> {
        self.check_available()?;
        Ok(self.orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn list_orders(&self) -> Result<Vec<DeliveryOrder>, AppError> {
        self.check_available()?;
        let mut orders: Vec<DeliveryOrder> = self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|order| order.created_at);
        Ok(orders)
    }

    async fn orders_for_courier(&self, courier_id: Uuid) -> Result<Vec<DeliveryOrder>, AppError> {
        self.check_available()?;
        Ok(self
            .orders
            .iter()
            .filter(|entry| {
                let order = entry.value();
                order.status.is_committed() && order.assigned_courier == Some(courier_id)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn insert_courier(&self, courier: Courier) -> Result<(), AppError> {
        self.check_available()?;
        self.couriers.insert(courier.id, courier);
        Ok(())
    }

    async fn get_courier(&self, courier_id: Uuid) -> Result<Option<Courier>, AppError> {
        self.check_available()?;
        Ok(self.couriers.get(&courier_id).map(|entry| entry.value().clone()))
    }

    async fn list_couriers(&self) -> Result<Vec<Courier>, AppError> {
        self.check_available()?;
        Ok(self
            .couriers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn set_courier_availability(
        &self,
        courier_id: Uuid,
        is_available: bool,
    ) -> Result<Option<Courier>, AppError> {
        self.check_available()?;
        Ok(self.couriers.get_mut(&courier_id).map(|mut courier| {
            courier.is_available = is_available;
            courier.updated_at = Utc::now();
            courier.clone()
        }))
    }

    async fn set_courier_location(
        &self,
        courier_id: Uuid,
        location: GeoPoint,
    ) -> Result<Option<Courier>, AppError> {
        self.check_available()?;
        Ok(self.couriers.get_mut(&courier_id).map(|mut courier| {
            courier.location = location;
            courier.updated_at = Utc::now();
            courier.clone()
        }))
    }

    async fn find_eligible_near(
        &self,
        origin: &GeoPoint,
        radius_m: f64,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<NearbyCourier>, AppError> {
        self.check_available()?;

        let mut nearby: Vec<NearbyCourier> = self
            .couriers
            .iter()
            .filter_map(|entry| {
                let courier = entry.value();
                if !courier.is_eligible() || exclude.contains(&courier.id) {
                    return None;
                }

                let distance_m = haversine_m(origin, &courier.location);
                if distance_m > radius_m {
                    return None;
                }

                Some(NearbyCourier {
                    courier: courier.clone(),
                    distance_m,
                })
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_m
                .total_cmp(&b.distance_m)
                .then_with(|| a.courier.id.cmp(&b.courier.id))
        });
        Ok(nearby)
    }

    async fn cas_assign_courier(&self, courier_id: Uuid, order_id: Uuid) -> Result<bool, AppError> {
        self.check_available()?;

        let Some(mut courier) = self.couriers.get_mut(&courier_id) else {
            return Ok(false);
        };
        if !courier.is_eligible() {
            return Ok(false);
        }

        courier.assigned_order = Some(order_id);
        courier.updated_at = Utc::now();
        Ok(true)
    }

    async fn cas_release_courier(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
    ) -> Result<bool, AppError> {
        self.check_available()?;

        let Some(mut courier) = self.couriers.get_mut(&courier_id) else {
            return Ok(false);
        };
        if courier.assigned_order != Some(order_id) {
            return Ok(false);
        }

        courier.assigned_order = None;
        courier.updated_at = Utc::now();
        Ok(true)
    }

    async fn apply_order_transition(
        &self,
        order_id: Uuid,
        expected: Expected,
        target: OrderStatus,
        fields: OrderFields,
    ) -> Result<Option<TransitionOutcome>, AppError> {
        self.check_available()?;

        let Some(mut order) = self.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if !expected.matches(&order) {
            return Ok(Some(TransitionOutcome::Mismatch(order.clone())));
        }

        fields.apply_to(&mut order);
        order.status = target;
        order.updated_at = Utc::now();
        Ok(Some(TransitionOutcome::Applied(order.clone())))
    }
}
