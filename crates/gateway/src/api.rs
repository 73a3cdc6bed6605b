//! HTTP surface: the WebSocket upgrade endpoint and the read-only health
//! status. Everything else speaks the frame protocol over `/ws`.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(crate::ws::ws_endpoint))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(status_payload(&state))
}

/// Shared by `/health` and the `status` method.
pub fn status_payload(state: &AppState) -> Value {
    let uptime_s = (chrono::Utc::now() - state.started_at).num_seconds();
    json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": uptime_s,
        "connections": state.channels.connection_count(),
        "sessions": state.sessions.statuses(),
        "pending_permissions": state.broker.pending_count(),
        "event_log_bytes": state.event_log.current_size(),
        "last_event_seq": state.event_log.last_seq(),
    })
}
