use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::coordinator::AssignmentCoordinator;
use crate::notify::BroadcastGateway;
use crate::observability::metrics::Metrics;
use crate::store::GeoStore;
use crate::store::memory::InMemoryGeoStore;

pub struct AppState {
    pub store: Arc<dyn GeoStore>,
    pub notifications: Arc<BroadcastGateway>,
    pub coordinator: Arc<AssignmentCoordinator>,
    pub order_tx: mpsc::Sender<Uuid>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> (Self, mpsc::Receiver<Uuid>) {
        Self::with_store(Arc::new(InMemoryGeoStore::new()), config)
    }

    pub fn with_store(
        store: Arc<dyn GeoStore>,
        config: &Config,
    ) -> (Self, mpsc::Receiver<Uuid>) {
        let (order_tx, order_rx) = mpsc::channel(config.order_queue_size);
        let notifications = Arc::new(BroadcastGateway::new(config.event_buffer_size));
        let metrics = Metrics::new();
        let coordinator = AssignmentCoordinator::new(
            store.clone(),
            notifications.clone(),
            metrics.clone(),
            config,
        );

        (
            Self {
                store,
                notifications,
                coordinator,
                order_tx,
                metrics,
            },
            order_rx,
        )
    }
}
