use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::offer::{Offer, ReleaseReason};
use crate::models::order::OrderStatus;

/// Payload pushed through the notification gateway.
///
/// Receivers must treat events as at-least-once: the same transition may be
/// observed twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    OfferMade {
        offer: Offer,
    },
    OfferWithdrawn {
        order_id: Uuid,
        courier_id: Uuid,
        reason: ReleaseReason,
    },
    StatusChanged {
        order_id: Uuid,
        status: OrderStatus,
        courier_id: Option<Uuid>,
    },
    AssignmentExhausted {
        order_id: Uuid,
        declined_by: Vec<Uuid>,
    },
    AssignmentStalled {
        order_id: Uuid,
        error: String,
    },
}
