//! Types exchanged with the store that are not part of the public data model.
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::models::{Conversation, Message};

/// A message about to be appended. `content` is trimmed by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Result of a combined resolve + append + touch.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub conversation: Conversation,
    pub message: Message,
    pub created_conversation: bool,
}

/// A conversation as seen by one viewer, before profile decoration.
#[derive(Debug, Clone)]
pub struct ConversationDigest {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub unread_count: u32,
}
