use crate::server::AppState;
use crate::store::StoreError;
use axum::extract::{Path, Query};
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route(
        "/api/v1/conversations/{id}",
        get(get_conversation).delete(delete_conversation),
    )
}

#[tracing::instrument(level = "debug", skip_all, fields(conversation_id = id))]
async fn get_conversation(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Json<serde_json::Value> {
    let store = state.assistant.store();
    let conversation = match store.get_conversation(id).await {
        Ok(Some(conversation)) => conversation,
        Ok(None) => return Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => return Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    };
    let turns = match store.list_turns(id, None).await {
        Ok(turns) => turns,
        Err(e) => return Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    };
    let status = conversation.status(Utc::now(), state.active_window);
    Json(serde_json::json!({
        "status": "ok",
        "conversation": conversation,
        "conversation_status": status,
        "turns": turns,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    /// Remove the conversation and its turns instead of marking it deleted.
    #[serde(default)]
    purge: bool,
}

/// Soft delete by default: the record stays, but it is never resolved again.
#[tracing::instrument(level = "info", skip_all, fields(conversation_id = id, purge = params.purge))]
async fn delete_conversation(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
) -> Json<serde_json::Value> {
    let store = state.assistant.store();
    let result = if params.purge {
        store.delete_conversation(id).await
    } else {
        store.soft_delete_conversation(id).await
    };
    match result {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })),
        Err(StoreError::NotFound(_)) => Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}
