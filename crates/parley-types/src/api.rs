use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// JWT claims shared by parley-api (REST middleware) and parley-gateway
/// (WebSocket Identify). Tokens are minted by the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    pub content: String,
    /// Client-chosen id; resubmitting the same id after a timeout does not duplicate the message.
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
}

// -- Errors --

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
    /// Id of a send that failed transiently; resubmit it as `client_message_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}
