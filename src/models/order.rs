use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    Pending,
    Offered,
    Accepted,
    Preparing,
    InDelivery,
    Delivered,
    Cancelled,
    Exhausted,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Exhausted
        )
    }

    /// States in which a courier has committed to the order.
    pub fn is_committed(self) -> bool {
        matches!(
            self,
            OrderStatus::Accepted | OrderStatus::Preparing | OrderStatus::InDelivery
        )
    }

    /// The status a committed courier may report next, if any.
    pub fn next_reported(self) -> Option<OrderStatus> {
        match self {
            OrderStatus::Accepted => Some(OrderStatus::Preparing),
            OrderStatus::Preparing => Some(OrderStatus::InDelivery),
            OrderStatus::InDelivery => Some(OrderStatus::Delivered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub id: Uuid,
    pub restaurant_location: GeoPoint,
    pub status: OrderStatus,
    /// Courier holding the tentative offer while `Offered`.
    pub offered_to: Option<Uuid>,
    /// Courier committed to the order from `Accepted` onwards.
    pub assigned_courier: Option<Uuid>,
    /// Couriers that declined or let an offer expire, in order of exclusion.
    pub declined_by: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryOrder {
    pub fn new(restaurant_location: GeoPoint) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            restaurant_location,
            status: OrderStatus::Pending,
            offered_to: None,
            assigned_courier: None,
            declined_by: Vec::new(),
            created_at: now,
            accepted_at: None,
            delivered_at: None,
            updated_at: now,
        }
    }

    /// The courier currently bound to this order, tentatively or committed.
    pub fn bound_courier(&self) -> Option<Uuid> {
        self.offered_to.or(self.assigned_courier)
    }

    pub fn has_declined(&self, courier_id: Uuid) -> bool {
        self.declined_by.contains(&courier_id)
    }
}

/// Change to a nullable field applied alongside a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> FieldUpdate<T> {
    pub fn apply(self, field: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => *field = Some(value),
            FieldUpdate::Clear => *field = None,
        }
    }
}

/// Field changes committed atomically with an order transition.
#[derive(Debug, Clone, Default)]
pub struct OrderFields {
    pub offered_to: FieldUpdate<Uuid>,
    pub assigned_courier: FieldUpdate<Uuid>,
    /// Appended to `declined_by` unless already present.
    pub declined: Option<Uuid>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OrderFields {
    pub fn apply_to(self, order: &mut DeliveryOrder) {
        self.offered_to.apply(&mut order.offered_to);
        self.assigned_courier.apply(&mut order.assigned_courier);
        if let Some(courier_id) = self.declined {
            if !order.declined_by.contains(&courier_id) {
                order.declined_by.push(courier_id);
            }
        }
        if let Some(at) = self.accepted_at {
            order.accepted_at = Some(at);
        }
        if let Some(at) = self.delivered_at {
            order.delivered_at = Some(at);
        }
    }
}
