use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::models::{ConversationSummary, Message};

/// Something the cache can absorb: a fetch result or a pushed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Full conversation list from a fetch. Authoritative for membership.
    ConversationList(Vec<ConversationSummary>),
    /// One list row changed.
    Conversation(ConversationSummary),
    /// Full history of one conversation from a fetch.
    History {
        conversation_id: Uuid,
        messages: Vec<Message>,
    },
    /// A single new message.
    Message(Message),
    /// Every message addressed to `reader_id` in the conversation is now read.
    Read {
        conversation_id: Uuid,
        reader_id: Uuid,
    },
}

impl CacheEvent {
    /// The cache-relevant part of a live event. Connection-level events map to `None`.
    pub fn from_gateway(event: GatewayEvent) -> Option<Self> {
        match event {
            GatewayEvent::MessageCreate { message } => Some(Self::Message(message)),
            GatewayEvent::MessagesRead {
                conversation_id,
                reader_id,
            } => Some(Self::Read {
                conversation_id,
                reader_id,
            }),
            GatewayEvent::ConversationUpdate { summary } => Some(Self::Conversation(summary)),
            GatewayEvent::Ready { .. } => None,
        }
    }
}

/// A viewer's in-memory copy of their conversation list and of the histories
/// they have opened. Every mutation goes through [`SessionCache::apply`], which
/// is idempotent: applying an event twice leaves the same state as applying it once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCache {
    /// Most recently active first, ties by id.
    conversations: Vec<ConversationSummary>,
    /// Loaded histories, each sorted by `(created_at, id)`.
    messages: HashMap<Uuid, Vec<Message>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Option<&ConversationSummary> {
        self.conversations.iter().find(|c| c.id() == conversation_id)
    }

    /// The loaded history of a conversation, `None` if it was never opened.
    pub fn messages(&self, conversation_id: Uuid) -> Option<&[Message]> {
        self.messages.get(&conversation_id).map(Vec::as_slice)
    }

    pub fn is_loaded(&self, conversation_id: Uuid) -> bool {
        self.messages.contains_key(&conversation_id)
    }

    /// Drop a loaded history. Returns whether one was present.
    pub fn forget(&mut self, conversation_id: Uuid) -> bool {
        self.messages.remove(&conversation_id).is_some()
    }

    /// Merge `event` into the cache. Returns whether anything changed.
    pub fn apply(&mut self, event: CacheEvent) -> bool {
        match event {
            CacheEvent::ConversationList(list) => self.replace_list(list),
            CacheEvent::Conversation(summary) => self.merge_summary(summary),
            CacheEvent::History {
                conversation_id,
                messages,
            } => {
                let created = !self.messages.contains_key(&conversation_id);
                let history = self.messages.entry(conversation_id).or_default();
                let mut changed = created;
                for message in messages {
                    changed |= merge_message(history, message);
                }
                changed
            }
            CacheEvent::Message(message) => {
                // A lone message is not a history; wait for the conversation to be opened.
                match self.messages.get_mut(&message.conversation_id) {
                    Some(history) => merge_message(history, message),
                    None => false,
                }
            }
            CacheEvent::Read {
                conversation_id,
                reader_id,
            } => {
                let Some(history) = self.messages.get_mut(&conversation_id) else {
                    return false;
                };
                let mut changed = false;
                for message in history.iter_mut() {
                    if message.receiver_id == reader_id && !message.is_read {
                        message.is_read = true;
                        changed = true;
                    }
                }
                changed
            }
        }
    }

    fn replace_list(&mut self, list: Vec<ConversationSummary>) -> bool {
        let mut next = Vec::with_capacity(list.len());
        for summary in list {
            // A push that overtook the fetch is newer than the fetched row.
            match self.conversation(summary.id()) {
                Some(existing) if existing.last_activity_at() > summary.last_activity_at() => {
                    next.push(existing.clone())
                }
                _ => next.push(summary),
            }
        }
        sort_conversations(&mut next);

        let ids: HashSet<Uuid> = next.iter().map(ConversationSummary::id).collect();
        let loaded = self.messages.len();
        self.messages.retain(|id, _| ids.contains(id));

        let changed = self.conversations != next || self.messages.len() != loaded;
        self.conversations = next;
        changed
    }

    fn merge_summary(&mut self, summary: ConversationSummary) -> bool {
        let mut history_changed = false;
        if let Some(message) = summary.last_message.clone() {
            if let Some(history) = self.messages.get_mut(&message.conversation_id) {
                history_changed = merge_message(history, message);
            }
        }

        match self.conversations.iter_mut().find(|c| c.id() == summary.id()) {
            Some(existing) => {
                if summary.last_activity_at() < existing.last_activity_at() || *existing == summary {
                    return history_changed;
                }
                *existing = summary;
            }
            None => self.conversations.push(summary),
        }
        sort_conversations(&mut self.conversations);
        true
    }
}

/// Insert-if-absent by id. An existing message only ever changes by `is_read`
/// going from false to true.
fn merge_message(history: &mut Vec<Message>, message: Message) -> bool {
    if let Some(existing) = history.iter_mut().find(|m| m.id == message.id) {
        if message.is_read && !existing.is_read {
            existing.is_read = true;
            return true;
        }
        return false;
    }

    history.push(message);
    history.sort_by_key(Message::order_key);
    true
}

fn sort_conversations(conversations: &mut [ConversationSummary]) {
    conversations.sort_by(|a, b| {
        b.last_activity_at()
            .cmp(&a.last_activity_at())
            .then_with(|| a.id().cmp(&b.id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use parley_types::models::{Conversation, Profile};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn message(conversation_id: Uuid, sender: Uuid, receiver: Uuid, secs: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender,
            receiver_id: receiver,
            content: format!("at {}", secs),
            created_at: at(secs),
            is_read: false,
        }
    }

    fn summary(id: Uuid, viewer: Uuid, secs: i64) -> ConversationSummary {
        let other = Uuid::new_v4();
        let (low, high) = if viewer < other { (viewer, other) } else { (other, viewer) };
        ConversationSummary {
            conversation: Conversation {
                id,
                participant_low: low,
                participant_high: high,
                last_activity_at: at(secs),
            },
            counterpart_id: other,
            counterpart: Profile::placeholder(),
            last_message: None,
            unread_count: 0,
        }
    }

    #[test]
    fn messages_are_inserted_once_and_kept_in_order() {
        let cid = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let late = message(cid, a, b, 20);
        let early = message(cid, b, a, 10);

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::History {
            conversation_id: cid,
            messages: vec![late.clone()],
        });
        assert!(cache.apply(CacheEvent::Message(early.clone())));
        assert!(!cache.apply(CacheEvent::Message(early.clone())));

        let ids: Vec<Uuid> = cache.messages(cid).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, [early.id, late.id]);
    }

    #[test]
    fn same_instant_messages_order_by_id() {
        let cid = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let first = message(cid, a, b, 5);
        let mut second = message(cid, b, a, 5);
        second.created_at = first.created_at;

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::History {
            conversation_id: cid,
            messages: vec![second.clone(), first.clone()],
        });

        let history = cache.messages(cid).unwrap();
        assert!(history[0].id < history[1].id);
    }

    #[test]
    fn existing_content_is_never_rewritten() {
        let cid = Uuid::new_v4();
        let original = message(cid, Uuid::new_v4(), Uuid::new_v4(), 1);
        let mut tampered = original.clone();
        tampered.content = "edited".into();

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::History {
            conversation_id: cid,
            messages: vec![original.clone()],
        });
        assert!(!cache.apply(CacheEvent::Message(tampered)));
        assert_eq!(cache.messages(cid).unwrap()[0].content, original.content);
    }

    #[test]
    fn read_flips_only_the_readers_messages() {
        let cid = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let to_b = message(cid, a, b, 1);
        let to_a = message(cid, b, a, 2);

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::History {
            conversation_id: cid,
            messages: vec![to_b, to_a],
        });

        let read = CacheEvent::Read {
            conversation_id: cid,
            reader_id: b,
        };
        assert!(cache.apply(read.clone()));
        assert!(!cache.apply(read));

        for m in cache.messages(cid).unwrap() {
            assert_eq!(m.is_read, m.receiver_id == b);
        }
    }

    #[test]
    fn stale_unread_copy_does_not_unflip() {
        let cid = Uuid::new_v4();
        let mut m = message(cid, Uuid::new_v4(), Uuid::new_v4(), 1);
        m.is_read = true;

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::History {
            conversation_id: cid,
            messages: vec![m.clone()],
        });
        m.is_read = false;
        assert!(!cache.apply(CacheEvent::Message(m)));
        assert!(cache.messages(cid).unwrap()[0].is_read);
    }

    #[test]
    fn push_into_a_seeded_history_survives_the_fetch() {
        let cid = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let fetched = message(cid, a, b, 1);
        let pushed = message(cid, b, a, 2);

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::History {
            conversation_id: cid,
            messages: Vec::new(),
        });
        assert!(cache.apply(CacheEvent::Message(pushed.clone())));
        cache.apply(CacheEvent::History {
            conversation_id: cid,
            messages: vec![fetched.clone()],
        });

        assert_eq!(cache.messages(cid).unwrap(), [fetched, pushed]);
    }

    #[test]
    fn pushed_message_without_history_is_ignored() {
        let cid = Uuid::new_v4();
        let mut cache = SessionCache::new();
        assert!(!cache.apply(CacheEvent::Message(message(cid, Uuid::new_v4(), Uuid::new_v4(), 1))));
        assert!(cache.messages(cid).is_none());
    }

    #[test]
    fn summaries_replace_by_id_and_resort() {
        let viewer = Uuid::new_v4();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::ConversationList(vec![
            summary(x, viewer, 20),
            summary(y, viewer, 10),
        ]));
        assert_eq!(cache.conversations()[0].id(), x);

        let mut bumped = summary(y, viewer, 30);
        bumped.unread_count = 1;
        assert!(cache.apply(CacheEvent::Conversation(bumped.clone())));

        assert_eq!(cache.conversations().len(), 2);
        assert_eq!(cache.conversations()[0], bumped);
        assert_eq!(cache.conversations()[1].id(), x);
    }

    #[test]
    fn older_summary_does_not_overwrite_newer() {
        let viewer = Uuid::new_v4();
        let id = Uuid::new_v4();
        let newer = summary(id, viewer, 50);
        let mut older = newer.clone();
        older.conversation.last_activity_at = newer.last_activity_at() - Duration::seconds(5);
        older.unread_count = 7;

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::Conversation(newer.clone()));
        assert!(!cache.apply(CacheEvent::Conversation(older)));
        assert_eq!(cache.conversation(id), Some(&newer));
    }

    #[test]
    fn equal_activity_summary_still_applies_read_counts() {
        let viewer = Uuid::new_v4();
        let id = Uuid::new_v4();
        let mut unread = summary(id, viewer, 5);
        unread.unread_count = 3;
        let mut read = unread.clone();
        read.unread_count = 0;

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::Conversation(unread));
        assert!(cache.apply(CacheEvent::Conversation(read)));
        assert_eq!(cache.conversation(id).unwrap().unread_count, 0);
    }

    #[test]
    fn summary_feeds_loaded_history() {
        let viewer = Uuid::new_v4();
        let id = Uuid::new_v4();
        let mut row = summary(id, viewer, 9);
        let last = message(id, row.counterpart_id, viewer, 9);
        row.last_message = Some(last.clone());

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::History {
            conversation_id: id,
            messages: Vec::new(),
        });
        cache.apply(CacheEvent::Conversation(row));
        assert_eq!(cache.messages(id).unwrap(), [last]);
    }

    #[test]
    fn fetched_list_keeps_rows_pushed_during_the_fetch() {
        let viewer = Uuid::new_v4();
        let id = Uuid::new_v4();
        let pushed = summary(id, viewer, 40);
        let mut fetched = pushed.clone();
        fetched.conversation.last_activity_at = at(30);

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::Conversation(pushed.clone()));
        cache.apply(CacheEvent::ConversationList(vec![fetched]));
        assert_eq!(cache.conversations(), [pushed]);
    }

    #[test]
    fn fetched_list_drops_vanished_conversations_and_their_history() {
        let viewer = Uuid::new_v4();
        let (kept, gone) = (Uuid::new_v4(), Uuid::new_v4());

        let mut cache = SessionCache::new();
        cache.apply(CacheEvent::ConversationList(vec![
            summary(kept, viewer, 2),
            summary(gone, viewer, 1),
        ]));
        cache.apply(CacheEvent::History {
            conversation_id: gone,
            messages: Vec::new(),
        });

        assert!(cache.apply(CacheEvent::ConversationList(vec![summary(kept, viewer, 2)])));
        assert!(cache.conversation(gone).is_none());
        assert!(!cache.is_loaded(gone));
    }

    #[test]
    fn applying_any_event_twice_equals_applying_once() {
        let viewer = Uuid::new_v4();
        let cid = Uuid::new_v4();
        let row = summary(cid, viewer, 3);
        let m = message(cid, row.counterpart_id, viewer, 3);

        let events = [
            CacheEvent::ConversationList(vec![row.clone()]),
            CacheEvent::History {
                conversation_id: cid,
                messages: vec![m.clone()],
            },
            CacheEvent::Message(message(cid, viewer, row.counterpart_id, 4)),
            CacheEvent::Read {
                conversation_id: cid,
                reader_id: viewer,
            },
            CacheEvent::Conversation(row),
        ];

        let mut cache = SessionCache::new();
        for event in events {
            cache.apply(event.clone());
            let once = cache.clone();
            assert!(!cache.apply(event));
            assert_eq!(cache, once);
        }
    }

    #[test]
    fn ready_is_not_a_cache_event() {
        let ready = GatewayEvent::Ready {
            user_id: Uuid::new_v4(),
        };
        assert_eq!(CacheEvent::from_gateway(ready), None);
    }
}
