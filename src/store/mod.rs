//! Geo store boundary for orders and couriers.
//!
//! The coordinator never does read-modify-write on a record it does not own
//! the lock for. Every write that participates in the assignment state
//! machine goes through one of the conditional primitives here:
//!
//! - [`GeoStore::cas_assign_courier`] binds an eligible courier to an order
//! - [`GeoStore::cas_release_courier`] unbinds it again
//! - [`GeoStore::apply_order_transition`] moves an order between states

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::courier::{Courier, GeoPoint};
use crate::models::order::{DeliveryOrder, OrderFields, OrderStatus};

/// An eligible courier together with its geodesic distance from the query origin.
#[derive(Debug, Clone)]
pub struct NearbyCourier {
    pub courier: Courier,
    pub distance_m: f64,
}

/// Precondition for [`GeoStore::apply_order_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub status: OrderStatus,
    /// Courier bound to the order (offered or committed). `None` means unbound.
    pub courier: Option<Uuid>,
}

impl Expected {
    pub fn unbound(status: OrderStatus) -> Self {
        Self {
            status,
            courier: None,
        }
    }

    pub fn bound(status: OrderStatus, courier: Uuid) -> Self {
        Self {
            status,
            courier: Some(courier),
        }
    }

    pub fn of(order: &DeliveryOrder) -> Self {
        Self {
            status: order.status,
            courier: order.bound_courier(),
        }
    }

    pub fn matches(&self, order: &DeliveryOrder) -> bool {
        order.status == self.status && order.bound_courier() == self.courier
    }
}

/// Result of a conditional order transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(DeliveryOrder),
    /// The order no longer matched the expectation; nothing was written.
    Mismatch(DeliveryOrder),
}

#[async_trait]
pub trait GeoStore: Send + Sync {
    async fn insert_order(&self, order: DeliveryOrder) -> Result<(), AppError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Option<DeliveryOrder>, AppError>;

    async fn list_orders(&self) -> Result<Vec<DeliveryOrder>, AppError>;

    /// Orders committed to `courier_id` that are not yet delivered.
    async fn orders_for_courier(&self, courier_id: Uuid) -> Result<Vec<DeliveryOrder>, AppError>;

    async fn insert_courier(&self, courier: Courier) -> Result<(), AppError>;

    async fn get_courier(&self, courier_id: Uuid) -> Result<Option<Courier>, AppError>;

    async fn list_couriers(&self) -> Result<Vec<Courier>, AppError>;

    /// Profile update. Never touches `assigned_order`.
    async fn set_courier_availability(
        &self,
        courier_id: Uuid,
        is_available: bool,
    ) -> Result<Option<Courier>, AppError>;

    /// Profile update. Never touches `assigned_order`.
    async fn set_courier_location(
        &self,
        courier_id: Uuid,
        location: GeoPoint,
    ) -> Result<Option<Courier>, AppError>;

    /// Eligible couriers within `radius_m` of `origin`, nearest first.
    ///
    /// Eligible means available with no `assigned_order`. Ties on distance are
    /// ordered by courier id.
    async fn find_eligible_near(
        &self,
        origin: &GeoPoint,
        radius_m: f64,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<NearbyCourier>, AppError>;

    /// Sets `assigned_order` to `order_id` only if the courier is still available
    /// and unassigned. Returns whether the write happened.
    async fn cas_assign_courier(&self, courier_id: Uuid, order_id: Uuid) -> Result<bool, AppError>;

    /// Clears `assigned_order` only if it still references `order_id`.
    async fn cas_release_courier(&self, courier_id: Uuid, order_id: Uuid)
    -> Result<bool, AppError>;

    /// Atomically moves the order to `target` and applies `fields`, provided the
    /// stored order still matches `expected`.
    ///
    /// Returns `Ok(None)` when the order does not exist.
    async fn apply_order_transition(
        &self,
        order_id: Uuid,
        expected: Expected,
        target: OrderStatus,
        fields: OrderFields,
    ) -> Result<Option<TransitionOutcome>, AppError>;
}
