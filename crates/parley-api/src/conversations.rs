use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

use parley_types::api::Claims;
use parley_types::models::{ConversationSummary, Message};

use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /conversations`: the caller's list, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.sync.conversations(claims.sub).await?))
}

/// `GET /conversations/{id}/messages`: full history, marking the caller's
/// incoming messages as read.
pub async fn open_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(
        state
            .sync
            .open_conversation(claims.sub, conversation_id)
            .await?,
    ))
}
