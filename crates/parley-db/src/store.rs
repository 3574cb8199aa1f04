use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::identity::ParticipantPair;
use parley_types::models::{Conversation, Message};

use crate::models::{ConversationDigest, Delivery, NewMessage};
use crate::{Database, Result};

/// The durable store consumed by the synchronizer. Calls are blocking; async
/// callers run them on the blocking pool.
pub trait Store: Send + Sync + 'static {
    fn get_or_create_conversation(
        &self,
        pair: ParticipantPair,
        at: DateTime<Utc>,
    ) -> Result<(Conversation, bool)>;

    fn find_conversation(&self, pair: ParticipantPair) -> Result<Option<Conversation>>;

    fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;

    fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<Conversation>;

    fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>>;

    fn digests_for_user(&self, viewer_id: Uuid) -> Result<Vec<ConversationDigest>>;

    fn digest_for(&self, conversation_id: Uuid, viewer_id: Uuid)
    -> Result<Option<ConversationDigest>>;

    fn append_message(&self, conversation_id: Uuid, new: &NewMessage) -> Result<Message>;

    fn messages_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>>;

    fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<usize>;

    /// Resolve, append and touch as one unit. The default composes the three
    /// steps for stores without transactions: a failed append leaves
    /// `last_activity_at` alone and its error is returned as-is.
    fn deliver(&self, pair: ParticipantPair, new: &NewMessage) -> Result<Delivery> {
        let (conversation, created_conversation) = self.get_or_create_conversation(pair, new.at)?;
        let message = self.append_message(conversation.id, new)?;
        let conversation = self.touch_conversation(conversation.id, message.created_at)?;
        Ok(Delivery {
            conversation,
            message,
            created_conversation,
        })
    }
}

impl Store for Database {
    fn get_or_create_conversation(
        &self,
        pair: ParticipantPair,
        at: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        Database::get_or_create_conversation(self, pair, at)
    }

    fn find_conversation(&self, pair: ParticipantPair) -> Result<Option<Conversation>> {
        Database::find_conversation(self, pair)
    }

    fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Database::get_conversation(self, id)
    }

    fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<Conversation> {
        Database::touch_conversation(self, id, at)
    }

    fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        Database::conversations_for_user(self, user_id)
    }

    fn digests_for_user(&self, viewer_id: Uuid) -> Result<Vec<ConversationDigest>> {
        Database::digests_for_user(self, viewer_id)
    }

    fn digest_for(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
    ) -> Result<Option<ConversationDigest>> {
        Database::digest_for(self, conversation_id, viewer_id)
    }

    fn append_message(&self, conversation_id: Uuid, new: &NewMessage) -> Result<Message> {
        Database::append_message(self, conversation_id, new)
    }

    fn messages_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        Database::messages_for_conversation(self, conversation_id)
    }

    fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<usize> {
        Database::mark_read(self, conversation_id, reader_id)
    }

    // Single IMMEDIATE transaction.
    fn deliver(&self, pair: ParticipantPair, new: &NewMessage) -> Result<Delivery> {
        Database::deliver(self, pair, new)
    }
}
