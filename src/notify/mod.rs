//! Fire-and-forget notification fan-out.
//!
//! The coordinator only sees [`NotificationGateway`]. The service wires in a
//! [`BroadcastGateway`] whose receivers are the websocket sessions.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::event::DispatchEvent;

pub trait NotificationGateway: Send + Sync {
    fn push_to_courier(&self, courier_id: Uuid, event: DispatchEvent);

    fn broadcast_to_order_watchers(&self, order_id: Uuid, event: DispatchEvent);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NotificationTarget {
    Courier(Uuid),
    Order(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub target: NotificationTarget,
    pub event: DispatchEvent,
}

#[derive(Debug, Clone)]
pub struct BroadcastGateway {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastGateway {
    pub fn new(buffer: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Live feed sessions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, target: NotificationTarget, event: DispatchEvent) {
        // No subscribers is fine: delivery is best-effort.
        if self.tx.send(Notification { target, event }).is_err() {
            trace!(?target, "notification dropped: no subscribers");
        }
    }
}

impl NotificationGateway for BroadcastGateway {
    fn push_to_courier(&self, courier_id: Uuid, event: DispatchEvent) {
        self.publish(NotificationTarget::Courier(courier_id), event);
    }

    fn broadcast_to_order_watchers(&self, order_id: Uuid, event: DispatchEvent) {
        self.publish(NotificationTarget::Order(order_id), event);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{BroadcastGateway, NotificationGateway, NotificationTarget};
    use crate::models::event::DispatchEvent;

    #[tokio::test]
    async fn subscribers_receive_targeted_events() {
        let gateway = BroadcastGateway::new(8);
        let mut rx = gateway.subscribe();
        let order_id = Uuid::new_v4();

        gateway.broadcast_to_order_watchers(
            order_id,
            DispatchEvent::AssignmentExhausted {
                order_id,
                declined_by: Vec::new(),
            },
        );

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.target, NotificationTarget::Order(order_id));
    }

    #[test]
    fn publishing_without_subscribers_does_not_panic() {
        let gateway = BroadcastGateway::new(8);
        gateway.push_to_courier(
            Uuid::new_v4(),
            DispatchEvent::AssignmentStalled {
                order_id: Uuid::new_v4(),
                error: "boom".to_string(),
            },
        );
    }
}
