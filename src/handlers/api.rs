use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use tracing::info;

use crate::downloads::{DownloadStatus, StatusMap};
use crate::handlers::hub::next_update;
use crate::state::AppState;

pub async fn list_downloads(State(state): State<AppState>) -> Json<StatusMap> {
    Json(state.store.snapshot())
}

pub async fn get_download(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DownloadStatus>, (StatusCode, Json<serde_json::Value>)> {
    state.store.get(&id).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Download ID not found", "id": id })),
        )
    })
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let feed = *state.feed_state.borrow();
    Json(serde_json::json!({
        "status": "ok",
        "feed": feed,
        "downloads": state.store.len(),
        "subscribers": state.notifier.subscriber_count(),
    }))
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.notifier.subscribe_primed(&state.store);
    info!(subscriber = subscription.id(), "SSE subscriber connected");

    let stream = stream::unfold((subscription, state), |(mut subscription, state)| async move {
        let update = tokio::select! {
            _ = state.shutdown.cancelled() => None,
            update = next_update(&mut subscription, &state) => update,
        }?;
        let event = Event::default().json_data(&*update.statuses);
        Some((event, (subscription, state)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
