use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{delete, get};
use axum::{Extension, Json};
use relay_channels::ChannelKind;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/sessions/{channel}/{key}", delete(unbind_session))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.assistant.sessions().list();
    Json(serde_json::json!({ "sessions": sessions }))
}

/// Forgets a session binding; the next message resolves its conversation afresh.
#[tracing::instrument(level = "info", skip_all, fields(channel = %channel, key = %key))]
async fn unbind_session(
    Extension(state): Extension<Arc<AppState>>,
    Path((channel, key)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let channel = match channel.parse::<ChannelKind>() {
        Ok(channel) => channel,
        Err(e) => return Json(serde_json::json!({ "status": "error", "error": e })),
    };
    let removed = state.assistant.sessions().unbind(channel, &key);
    Json(serde_json::json!({ "status": if removed { "ok" } else { "not_found" } }))
}
