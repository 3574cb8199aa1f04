use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use parley_types::identity::ParticipantPair;
use parley_types::models::{Conversation, Message, Profile};

use crate::models::{ConversationDigest, Delivery, NewMessage};
use crate::{Database, Result, StoreError};

const CONVERSATION_COLUMNS: &str = "c.id, c.participant_low, c.participant_high, c.last_activity_at";

const MESSAGE_COLUMNS: &str =
    "m.id, m.conversation_id, m.sender_id, m.receiver_id, m.content, m.created_at, m.is_read";

impl Database {
    // -- Conversations --

    /// Idempotent upsert on the canonical pair. Returns the row and whether this call created it.
    pub fn get_or_create_conversation(
        &self,
        pair: ParticipantPair,
        at: DateTime<Utc>,
    ) -> Result<(Conversation, bool)> {
        self.with_conn_mut(|conn| get_or_create_in(conn, pair, at))
    }

    pub fn find_conversation(&self, pair: ParticipantPair) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation_by_pair(conn, pair))
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation_by_id(conn, id))
    }

    /// `last_activity_at = max(last_activity_at, at)`.
    pub fn touch_conversation(&self, id: Uuid, at: DateTime<Utc>) -> Result<Conversation> {
        self.with_conn_mut(|conn| touch_in(conn, id, at))
    }

    /// Every conversation `user_id` takes part in, most recently active first.
    pub fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| query_conversations_for_user(conn, user_id))
    }

    /// Like `conversations_for_user`, with the last message and the viewer's unread count.
    pub fn digests_for_user(&self, viewer_id: Uuid) -> Result<Vec<ConversationDigest>> {
        self.with_conn(|conn| query_digests(conn, viewer_id, None))
    }

    pub fn digest_for(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
    ) -> Result<Option<ConversationDigest>> {
        self.with_conn(|conn| {
            Ok(query_digests(conn, viewer_id, Some(conversation_id))?
                .into_iter()
                .next())
        })
    }

    // -- Messages --

    pub fn append_message(&self, conversation_id: Uuid, new: &NewMessage) -> Result<Message> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let message = append_in(&tx, conversation_id, new)?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Full history, ascending by `(created_at, id)`.
    pub fn messages_for_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            if query_conversation_by_id(conn, conversation_id)?.is_none() {
                return Err(StoreError::NotFound(format!("conversation {}", conversation_id)));
            }
            query_messages(conn, conversation_id)
        })
    }

    /// Flags every unread message addressed to `reader_id` as read. Returns how many flipped.
    pub fn mark_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<usize> {
        self.with_conn_mut(|conn| {
            if query_conversation_by_id(conn, conversation_id)?.is_none() {
                return Err(StoreError::NotFound(format!("conversation {}", conversation_id)));
            }

            let flipped = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                (conversation_id.to_string(), reader_id.to_string()),
            )?;
            Ok(flipped)
        })
    }

    /// Resolve-or-create the conversation, append the message and bump activity
    /// in one transaction. Nothing is persisted unless all three succeed.
    pub fn deliver(&self, pair: ParticipantPair, new: &NewMessage) -> Result<Delivery> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let (conversation, created_conversation) = get_or_create_in(&tx, pair, new.at)?;
            let message = append_in(&tx, conversation.id, new)?;
            let conversation = touch_in(&tx, conversation.id, message.created_at)?;

            tx.commit()?;
            Ok(Delivery {
                conversation,
                message,
                created_conversation,
            })
        })
    }

    // -- Profiles --

    pub fn upsert_profile(&self, user_id: Uuid, profile: &Profile) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO profiles (user_id, display_name, avatar_url) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    avatar_url = excluded.avatar_url",
                (user_id.to_string(), &profile.display_name, &profile.avatar_url),
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>> {
        self.with_conn(|conn| {
            let profile = conn
                .query_row(
                    "SELECT display_name, avatar_url FROM profiles WHERE user_id = ?1",
                    [user_id.to_string()],
                    |row| {
                        Ok(Profile {
                            display_name: row.get(0)?,
                            avatar_url: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(profile)
        })
    }
}

fn get_or_create_in(
    conn: &Connection,
    pair: ParticipantPair,
    at: DateTime<Utc>,
) -> Result<(Conversation, bool)> {
    if let Some(existing) = query_conversation_by_pair(conn, pair)? {
        return Ok((existing, false));
    }

    let id = Uuid::new_v4();
    let inserted = conn.execute(
        "INSERT INTO conversations (id, participant_low, participant_high, last_activity_at)
         VALUES (?1, ?2, ?3, ?4)",
        (
            id.to_string(),
            pair.low().to_string(),
            pair.high().to_string(),
            at.timestamp_micros(),
        ),
    );

    match inserted.map_err(StoreError::from) {
        Ok(_) => {
            debug!("Created conversation {} for {} / {}", id, pair.low(), pair.high());
            let conversation = query_conversation_by_id(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
            Ok((conversation, true))
        }
        // Another writer created the pair between our lookup and insert: theirs wins.
        Err(StoreError::Conflict(reason)) => {
            debug!("Conversation insert lost race for {} / {}: {}", pair.low(), pair.high(), reason);
            let winner = query_conversation_by_pair(conn, pair)?
                .ok_or(StoreError::Conflict(reason))?;
            Ok((winner, false))
        }
        Err(e) => Err(e),
    }
}

fn touch_in(conn: &Connection, id: Uuid, at: DateTime<Utc>) -> Result<Conversation> {
    let updated = conn.execute(
        "UPDATE conversations SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
        (id.to_string(), at.timestamp_micros()),
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!("conversation {}", id)));
    }

    query_conversation_by_id(conn, id)?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))
}

fn append_in(conn: &Connection, conversation_id: Uuid, new: &NewMessage) -> Result<Message> {
    let content = new.content.trim();
    if content.is_empty() {
        return Err(StoreError::Invalid("message content is empty".into()));
    }

    let conversation = query_conversation_by_id(conn, conversation_id)?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))?;

    if new.sender_id == new.receiver_id
        || !conversation.has_participant(new.sender_id)
        || !conversation.has_participant(new.receiver_id)
    {
        return Err(StoreError::Invalid(format!(
            "{} -> {} does not match conversation {}",
            new.sender_id, new.receiver_id, conversation_id
        )));
    }

    // A retried submission with the same id returns the stored row.
    if let Some(existing) = query_message_by_id(conn, new.id)? {
        if existing.conversation_id == conversation_id
            && existing.sender_id == new.sender_id
            && existing.content == content
        {
            debug!("Message {} already stored, returning existing row", new.id);
            return Ok(existing);
        }
        return Err(StoreError::Conflict(format!("message id {} already in use", new.id)));
    }

    // created_at is strictly increasing within a conversation, so ties never
    // depend on the random id.
    let previous: Option<i64> = conn.query_row(
        "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
        [conversation_id.to_string()],
        |row| row.get(0),
    )?;
    let mut created_at = new.at.timestamp_micros();
    if let Some(previous) = previous {
        created_at = created_at.max(previous + 1);
    }

    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, content, created_at, is_read)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        (
            new.id.to_string(),
            conversation_id.to_string(),
            new.sender_id.to_string(),
            new.receiver_id.to_string(),
            content,
            created_at,
        ),
    )?;

    Ok(Message {
        id: new.id,
        conversation_id,
        sender_id: new.sender_id,
        receiver_id: new.receiver_id,
        content: content.to_string(),
        created_at: micros_to_time(created_at)
            .ok_or_else(|| StoreError::Invalid(format!("timestamp out of range: {}", created_at)))?,
        is_read: false,
    })
}

fn query_conversation_by_pair(
    conn: &Connection,
    pair: ParticipantPair,
) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c
         WHERE c.participant_low = ?1 AND c.participant_high = ?2"
    );
    let row = conn
        .query_row(
            &sql,
            (pair.low().to_string(), pair.high().to_string()),
            |row| conversation_from_row(row, 0),
        )
        .optional()?;
    Ok(row)
}

fn query_conversation_by_id(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1");
    let row = conn
        .query_row(&sql, [id.to_string()], |row| conversation_from_row(row, 0))
        .optional()?;
    Ok(row)
}

fn query_conversations_for_user(conn: &Connection, user_id: Uuid) -> Result<Vec<Conversation>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c
         WHERE c.participant_low = ?1 OR c.participant_high = ?1
         ORDER BY c.last_activity_at DESC, c.id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([user_id.to_string()], |row| conversation_from_row(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_digests(
    conn: &Connection,
    viewer_id: Uuid,
    only: Option<Uuid>,
) -> Result<Vec<ConversationDigest>> {
    // Last message joined in the same query (no per-conversation round trip)
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS},
            (SELECT COUNT(*) FROM messages u
              WHERE u.conversation_id = c.id AND u.receiver_id = ?1 AND u.is_read = 0),
            {MESSAGE_COLUMNS}
         FROM conversations c
         LEFT JOIN messages m ON m.id = (
            SELECT l.id FROM messages l
             WHERE l.conversation_id = c.id
             ORDER BY l.created_at DESC, l.id DESC
             LIMIT 1)
         WHERE (c.participant_low = ?1 OR c.participant_high = ?1)
           AND (?2 IS NULL OR c.id = ?2)
         ORDER BY c.last_activity_at DESC, c.id ASC"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            (viewer_id.to_string(), only.map(|id| id.to_string())),
            |row| {
                let conversation = conversation_from_row(row, 0)?;
                let unread_count: u32 = row.get(4)?;
                let last_message = match row.get::<_, Option<String>>(5)? {
                    Some(_) => Some(message_from_row(row, 5)?),
                    None => None,
                };
                Ok(ConversationDigest {
                    conversation,
                    last_message,
                    unread_count,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_message_by_id(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1");
    let row = conn
        .query_row(&sql, [id.to_string()], |row| message_from_row(row, 0))
        .optional()?;
    Ok(row)
}

fn query_messages(conn: &Connection, conversation_id: Uuid) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m
         WHERE m.conversation_id = ?1
         ORDER BY m.created_at ASC, m.id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([conversation_id.to_string()], |row| message_from_row(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn conversation_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, base)?,
        participant_low: uuid_at(row, base + 1)?,
        participant_high: uuid_at(row, base + 2)?,
        last_activity_at: time_at(row, base + 3)?,
    })
}

fn message_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, base)?,
        conversation_id: uuid_at(row, base + 1)?,
        sender_id: uuid_at(row, base + 2)?,
        receiver_id: uuid_at(row, base + 3)?,
        content: row.get(base + 4)?,
        created_at: time_at(row, base + 5)?,
        is_read: row.get(base + 6)?,
    })
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let micros: i64 = row.get(idx)?;
    micros_to_time(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn micros_to_time(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}
