use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::{ok, RequestId};
use crate::ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/stats", get(stats))
        .route("/health", get(health))
}

async fn upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, state))
}

async fn stats(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    ok(&request_id, state.broadcaster.stats().await)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.broadcaster.stats().await;
    Json(json!({
        "status": "healthy",
        "service": "discret-realtime",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.sessions,
        "timestamp": Utc::now(),
    }))
}
