use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Courier {
    pub id: Uuid,
    pub name: String,
    pub location: GeoPoint,
    pub is_available: bool,
    /// Order this courier is offered or committed to. Written only by the coordinator.
    pub assigned_order: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl Courier {
    pub fn new(name: impl Into<String>, location: GeoPoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            location,
            is_available: true,
            assigned_order: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.is_available && self.assigned_order.is_none()
    }
}
