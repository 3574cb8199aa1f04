pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, AppStateInner};

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

/// Every REST route, behind bearer authentication.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/messages", post(messages::send_message))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::open_conversation),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state)
}
