use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tentative courier-to-order binding awaiting the courier's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub distance_km: f64,
    pub offered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Declined,
    Expired,
    Cancelled,
}

impl ReleaseReason {
    pub fn as_label(self) -> &'static str {
        match self {
            ReleaseReason::Declined => "declined",
            ReleaseReason::Expired => "expired",
            ReleaseReason::Cancelled => "cancelled",
        }
    }
}
