use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::debug;

use parley_types::api::{Claims, SendMessageRequest};

use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /messages`: the sender is always the authenticated user.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = match req.client_message_id {
        Some(message_id) => {
            state
                .sync
                .send_with_id(claims.sub, req.receiver_id, &req.content, message_id)
                .await?
        }
        None => state.sync.send(claims.sub, req.receiver_id, &req.content).await?,
    };

    debug!("{} sent {} via REST", claims.sub, message.id);
    Ok((StatusCode::CREATED, Json(message)))
}
