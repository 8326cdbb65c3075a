mod config;
mod downloads;
mod error;
mod feed;
mod handlers;
mod notifier;
mod state;
mod tasks;

use axum::{Router, routing::get};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Level, error, info};

use crate::config::Settings;
use crate::downloads::StatusStore;
use crate::feed::{FeedConnector, FeedOptions};
use crate::handlers::{api, hub};
use crate::notifier::ChangeNotifier;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting Vidra progress service...");

    let feed_url = match settings.feed_url() {
        Ok(url) => url,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let store = StatusStore::new();
    let notifier = ChangeNotifier::new(settings.subscriber_buffer);
    let connector = FeedConnector::new(
        feed_url,
        store.clone(),
        notifier.clone(),
        FeedOptions::from(&settings),
    );
    let shutdown = CancellationToken::new();

    let state = AppState {
        settings: settings.clone(),
        store,
        notifier,
        feed_state: connector.state(),
        shutdown: shutdown.clone(),
    };

    // Start background tasks (Signals, Feed)
    let feed_task = tasks::start_background_tasks(connector, shutdown.clone());

    // --- Router Setup ---
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            shutdown.cancel();
            std::process::exit(1);
        }
    };
    info!("Listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
    {
        error!("Server error: {}", e);
    }

    shutdown.cancel();
    if let Err(e) = feed_task.await {
        error!("Feed task failed: {}", e);
    }
    info!("Vidra progress service stopped.");
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/downloads", get(api::list_downloads))
        .route("/api/downloads/{id}", get(api::get_download))
        .route("/api/health", get(api::health))
        .route("/events", get(api::sse_handler))
        .route("/hubs/video-progress", get(hub::progress_hub))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
