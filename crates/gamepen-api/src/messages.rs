use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::error;

use gamepen_types::api::Claims;
use gamepen_types::models::{ChatMessage, DirectMessage};

use crate::AppState;
use crate::error::ApiError;

/// GET /api/messages/genre/{genre}: full channel history, oldest first.
pub async fn genre_history(
    State(state): State<AppState>,
    Path(genre): Path<String>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    // Run blocking DB query off the async runtime
    let db = state.db.clone();
    let rows = tokio::task::spawn_blocking(move || db.get_chat_messages(&genre))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            anyhow::anyhow!("history query task failed")
        })??;

    let messages: Vec<ChatMessage> = rows.into_iter().map(ChatMessage::from).collect();
    Ok(Json(messages))
}

/// GET /api/messages/direct/{user_a}/{user_b}: conversation between two
/// users, oldest first. The caller must be one of them.
pub async fn direct_history(
    State(state): State<AppState>,
    Path((user_a, user_b)): Path<(String, String)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    if claims.sub != user_a && claims.sub != user_b {
        return Err(ApiError::Forbidden(
            "Not a participant in this conversation".into(),
        ));
    }

    let db = state.db.clone();
    let rows = tokio::task::spawn_blocking(move || db.get_direct_messages(&user_a, &user_b))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            anyhow::anyhow!("history query task failed")
        })??;

    let messages: Vec<DirectMessage> = rows.into_iter().map(DirectMessage::from).collect();
    Ok(Json(messages))
}
