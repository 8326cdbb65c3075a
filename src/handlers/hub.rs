use crate::notifier::{StatusUpdate, Subscription};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub async fn progress_hub(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state))
}

/// Waits for the next update. If the notifier dropped this subscriber for
/// falling behind, registers again and continues from a fresh snapshot.
pub async fn next_update(subscription: &mut Subscription, state: &AppState) -> Option<StatusUpdate> {
    loop {
        if let Some(update) = subscription.recv().await {
            return Some(update);
        }
        if state.shutdown.is_cancelled() {
            return None;
        }
        warn!(
            subscriber = subscription.id(),
            "Subscriber fell behind, resyncing with a fresh snapshot"
        );
        *subscription = state.notifier.subscribe_primed(&state.store);
    }
}

async fn serve_subscriber(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    let mut subscription = state.notifier.subscribe_primed(&state.store);
    info!(
        conn_id = %conn_id,
        subscriber = subscription.id(),
        "Progress subscriber connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            update = next_update(&mut subscription, &state) => {
                let Some(update) = update else { break };
                let payload = match serde_json::to_string(&*update.statuses) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(conn_id = %conn_id, error = %e, "Failed to serialize status update");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(payload.into())).await {
                    debug!(conn_id = %conn_id, error = %e, "Progress subscriber write failed");
                    break;
                }
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn_id = %conn_id, error = %e, "Progress subscriber read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    state.notifier.unsubscribe(subscription.id());
    info!(conn_id = %conn_id, "Progress subscriber disconnected");
}
