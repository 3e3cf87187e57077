use crate::assistant::RecoverOutcome;
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::post;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/turns/{id}/recover", post(recover_turn))
}

/// Retries persisting a reply that was delivered but could not be saved.
#[tracing::instrument(level = "info", skip_all, fields(turn_id = id))]
async fn recover_turn(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Json<serde_json::Value> {
    match state.assistant.recover_turn(id).await {
        Ok(outcome) => {
            let status = match outcome {
                RecoverOutcome::Recovered => "ok",
                RecoverOutcome::AlreadyPersisted => "already_persisted",
                RecoverOutcome::TurnMissing => "not_found",
                RecoverOutcome::NothingCached => "nothing_cached",
            };
            Json(serde_json::json!({ "status": status, "turn_id": id }))
        }
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}
