use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/healthz", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let assistant = &state.assistant;
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "channels": state.channels,
        "checks": {
            "thread_locks": assistant.locks().len(),
            "session_bindings": assistant.sessions().len(),
            "pending_recoveries": assistant.recovery_cache().len(),
        }
    }))
}
