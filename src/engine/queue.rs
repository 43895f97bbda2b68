use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::retry::with_backoff;
use crate::error::AppError;
use crate::models::order::OrderStatus;
use crate::state::AppState;

pub async fn enqueue_order(state: &AppState, order_id: Uuid) -> Result<(), AppError> {
    state
        .order_tx
        .send(order_id)
        .await
        .map_err(|err| AppError::Internal(format!("order queue send failed: {err}")))?;

    state.metrics.orders_in_queue.inc();
    Ok(())
}

/// Drains new orders and runs one assignment task per order.
pub async fn run_assignment_engine(state: Arc<AppState>, mut order_rx: mpsc::Receiver<Uuid>) {
    info!("assignment engine started");

    while let Some(order_id) = order_rx.recv().await {
        state.metrics.orders_in_queue.dec();

        let coordinator = state.coordinator.clone();
        tokio::spawn(async move {
            let result = with_backoff(coordinator.retry_policy(), "trigger assignment", || {
                coordinator.trigger_assignment(order_id)
            })
            .await;

            match result {
                Ok(order) if order.status == OrderStatus::Exhausted => {
                    warn!(order_id = %order_id, "order exhausted at intake");
                }
                Ok(_) => {}
                Err(err) if err.is_terminal_rejection() => {
                    debug!(order_id = %order_id, error = %err, "order closed before intake");
                }
                Err(err @ AppError::Retryable(_)) => coordinator.stall(order_id, &err),
                Err(err) => {
                    error!(order_id = %order_id, error = %err, "failed to process order");
                }
            }
        });
    }

    warn!("assignment engine stopped: queue channel closed");
}
