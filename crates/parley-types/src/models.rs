use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A one-to-one conversation. Exactly one row exists per unordered pair of users;
/// the participants are stored in canonical order (`participant_low < participant_high`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participant_low: Uuid,
    pub participant_high: Uuid,
    pub last_activity_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participant_low == user_id || self.participant_high == user_id
    }

    /// The other participant, from `user_id`'s point of view.
    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.participant_low {
            Some(self.participant_high)
        } else if user_id == self.participant_high {
            Some(self.participant_low)
        } else {
            None
        }
    }
}

/// A direct message. Immutable once stored, except for the `is_read` flip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// Total order of messages inside one conversation.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Display data for a user, owned by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Profile {
    pub const PLACEHOLDER_NAME: &'static str = "Unknown User";

    /// Used when a profile cannot be resolved; never blocks message delivery.
    pub fn placeholder() -> Self {
        Self {
            display_name: Self::PLACEHOLDER_NAME.to_string(),
            avatar_url: None,
        }
    }
}

/// One row of a viewer's conversation list, personalised for that viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub counterpart_id: Uuid,
    pub counterpart: Profile,
    pub last_message: Option<Message>,
    pub unread_count: u32,
}

impl ConversationSummary {
    pub fn id(&self) -> Uuid {
        self.conversation.id
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.conversation.last_activity_at
    }
}
