use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationSummary, Message};

/// Events pushed to live subscribers (in-process sessions and WebSocket clients).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid },

    /// A new message was appended to a conversation
    MessageCreate { message: Message },

    /// `reader_id` has read every message addressed to them in the conversation
    MessagesRead { conversation_id: Uuid, reader_id: Uuid },

    /// A conversation list row changed for the receiving viewer
    ConversationUpdate { summary: ConversationSummary },
}

impl GatewayEvent {
    /// Returns the conversation this event belongs to, if any.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreate { message } => Some(message.conversation_id),
            Self::MessagesRead { conversation_id, .. } => Some(*conversation_id),
            Self::ConversationUpdate { summary } => Some(summary.conversation.id),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving message-level events for an open conversation view
    WatchConversation { conversation_id: Uuid },

    /// Stop receiving message-level events for a conversation view
    UnwatchConversation { conversation_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_tagged_representation() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"WatchConversation","data":{{"conversation_id":"{id}"}}}}"#);
        let cmd: GatewayCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd, GatewayCommand::WatchConversation { conversation_id: id });
    }

    #[test]
    fn read_event_is_scoped_to_its_conversation() {
        let conversation_id = Uuid::new_v4();
        let event = GatewayEvent::MessagesRead {
            conversation_id,
            reader_id: Uuid::new_v4(),
        };
        assert_eq!(event.conversation_id(), Some(conversation_id));
        assert_eq!(GatewayEvent::Ready { user_id: Uuid::new_v4() }.conversation_id(), None);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MessagesRead");
    }
}
