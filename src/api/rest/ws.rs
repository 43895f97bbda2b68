use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::notify::{Notification, NotificationTarget};
use crate::state::AppState;

/// Exactly one of the two keys selects the feed.
#[derive(Debug, Deserialize)]
pub struct WatchParams {
    pub courier_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
}

impl WatchParams {
    fn target(&self) -> Result<NotificationTarget, AppError> {
        match (self.courier_id, self.order_id) {
            (Some(courier_id), None) => Ok(NotificationTarget::Courier(courier_id)),
            (None, Some(order_id)) => Ok(NotificationTarget::Order(order_id)),
            _ => Err(AppError::BadRequest(
                "pass exactly one of courier_id or order_id".to_string(),
            )),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WatchParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let target = params.target()?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, target)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, target: NotificationTarget) {
    let (sender, receiver) = socket.split();
    let feed = BroadcastStream::new(state.notifications.subscribe());

    info!(?target, "websocket client connected");
    pump(sender, receiver, feed, target).await;
    info!(?target, "websocket client disconnected");
}

/// Forwards events for `target` until either side closes, then tears down the other side.
async fn pump<Tx, Rx, E>(
    mut sender: Tx,
    mut receiver: Rx,
    mut feed: BroadcastStream<Notification>,
    target: NotificationTarget,
) where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = feed.next().await {
            let notification = match item {
                Ok(notification) => notification,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(?target, skipped, "websocket client lagging; events dropped");
                    continue;
                }
            };
            if notification.target != target {
                continue;
            }

            let json = match serde_json::to_string(&notification.event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
